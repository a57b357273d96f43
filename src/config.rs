use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{RaptorError, RaptorResult};

/// Comma-separated list of embedding credentials.
pub const EMBED_KEYS_ENV: &str = "RAPTOR_EMBED_API_KEYS";
pub const LLM_KEY_ENV: &str = "RAPTOR_LLM_API_KEY";

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub raptor: RaptorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Which wire protocol the embedding slots speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// `POST {api_base}/embeddings` with one bearer key per slot.
    #[default]
    OpenaiCompatible,
    /// Local Ollama `POST {api_base}/api/embed`; needs no keys.
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,
    /// Pool slots opened against a key-less local backend.
    #[serde(default = "default_local_lanes")]
    pub local_lanes: usize,
    #[serde(default = "default_embed_base")]
    pub api_base: String,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Request field carrying the dimension (`output_dimension` for Voyage,
    /// `dimensions` for OpenAI). Empty omits it.
    #[serde(default = "default_dimension_field")]
    pub dimension_field: String,
    /// Falls back to env var RAPTOR_EMBED_API_KEYS when empty.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Requests admitted per key inside one window.
    #[serde(default = "default_rpm")]
    pub rpm_limit: u32,
    /// Tokens admitted per key inside one window.
    #[serde(default = "default_tpm")]
    pub tpm_limit: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// In-flight calls allowed per key.
    #[serde(default = "default_per_key_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    /// Consecutive failures before a key is taken out of rotation.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Each key may be tried this many times per group before giving up.
    #[serde(default = "default_failover_rounds")]
    pub failover_rounds: usize,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_embed_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_embed_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_embed_jitter")]
    pub retry_jitter_ms: u64,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_min_batch")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch")]
    pub max_batch_size: usize,
    #[serde(default = "default_true")]
    pub adaptive_enabled: bool,
    #[serde(default = "default_target_secs")]
    pub target_response_secs: f64,
    #[serde(default = "default_slow_secs")]
    pub slow_threshold_secs: f64,
    #[serde(default = "default_fast_secs")]
    pub fast_threshold_secs: f64,
    #[serde(default = "default_cooldown_secs")]
    pub adjustment_cooldown_secs: u64,
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base")]
    pub api_base: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Falls back to env var RAPTOR_LLM_API_KEY when absent.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Global bound on concurrent completion calls.
    #[serde(default = "default_completion_concurrency")]
    pub concurrency: usize,
    /// Spacing between completion calls is derived from this (0 disables pacing).
    #[serde(default = "default_llm_rpm")]
    pub rpm_limit: u32,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: f64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: f64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter_secs: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// `{max_tokens}` is substituted before sending.
    #[serde(default = "default_summary_prompt")]
    pub summary_prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaptorConfig {
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_max_levels")]
    pub max_levels: usize,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    #[serde(default = "default_components")]
    pub umap_n_components: usize,
    #[serde(default = "default_metric")]
    pub umap_metric: DistanceMetric,
    /// Whole-build deadline; unset means no deadline.
    #[serde(default)]
    pub build_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub llm_enabled: bool,
    #[serde(default = "default_llm_cache_size")]
    pub llm_max_size: usize,
    #[serde(default = "default_llm_cache_ttl")]
    pub llm_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub embed_enabled: bool,
    #[serde(default = "default_embed_cache_size")]
    pub embed_max_size: usize,
    #[serde(default = "default_embed_cache_ttl")]
    pub embed_ttl_secs: u64,
}

fn default_embed_base() -> String {
    "https://api.voyageai.com/v1".into()
}
fn default_embed_model() -> String {
    "voyage-3".into()
}
fn default_dimension() -> usize {
    1024
}
fn default_local_lanes() -> usize {
    2
}
fn default_dimension_field() -> String {
    "output_dimension".into()
}
fn default_rpm() -> u32 {
    3
}
fn default_tpm() -> u64 {
    10_000
}
fn default_window_secs() -> u64 {
    60
}
fn default_per_key_concurrency() -> usize {
    2
}
fn default_embed_retries() -> u32 {
    3
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_failover_rounds() -> usize {
    3
}
fn default_token_budget() -> usize {
    12_000
}
fn default_request_timeout() -> u64 {
    60
}
fn default_embed_base_delay() -> u64 {
    1_000
}
fn default_embed_max_delay() -> u64 {
    30_000
}
fn default_embed_jitter() -> u64 {
    500
}
fn default_batch_size() -> usize {
    12
}
fn default_min_batch() -> usize {
    4
}
fn default_max_batch() -> usize {
    24
}
fn default_target_secs() -> f64 {
    2.0
}
fn default_slow_secs() -> f64 {
    4.0
}
fn default_fast_secs() -> f64 {
    1.0
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_sample_window() -> usize {
    10
}
fn default_llm_base() -> String {
    "https://api.deepseek.com/v1".into()
}
fn default_llm_model() -> String {
    "deepseek-chat".into()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f64 {
    0.3
}
fn default_completion_concurrency() -> usize {
    20
}
fn default_llm_rpm() -> u32 {
    60
}
fn default_llm_retries() -> u32 {
    3
}
fn default_backoff_base() -> f64 {
    1.0
}
fn default_backoff_max() -> f64 {
    30.0
}
fn default_backoff_jitter() -> f64 {
    0.25
}
fn default_summary_prompt() -> String {
    "You are summarizing a cluster of related passages from one document. \
Write a single dense summary of at most {max_tokens} tokens that keeps names, \
numbers and key facts. Do not mention the passage labels."
        .into()
}
fn default_max_clusters() -> usize {
    64
}
fn default_threshold() -> f64 {
    0.1
}
fn default_max_levels() -> usize {
    10
}
fn default_seed() -> u64 {
    42
}
fn default_components() -> usize {
    12
}
fn default_metric() -> DistanceMetric {
    DistanceMetric::Cosine
}
fn default_llm_cache_size() -> usize {
    3_000
}
fn default_llm_cache_ttl() -> u64 {
    3_600
}
fn default_embed_cache_size() -> usize {
    10_000
}
fn default_embed_cache_ttl() -> u64 {
    86_400
}
fn default_true() -> bool {
    true
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            local_lanes: default_local_lanes(),
            api_base: default_embed_base(),
            model: default_embed_model(),
            dimension: default_dimension(),
            dimension_field: default_dimension_field(),
            api_keys: Vec::new(),
            rpm_limit: default_rpm(),
            tpm_limit: default_tpm(),
            window_secs: default_window_secs(),
            concurrency: default_per_key_concurrency(),
            max_retries: default_embed_retries(),
            failure_threshold: default_failure_threshold(),
            failover_rounds: default_failover_rounds(),
            token_budget: default_token_budget(),
            request_timeout_secs: default_request_timeout(),
            retry_base_delay_ms: default_embed_base_delay(),
            retry_max_delay_ms: default_embed_max_delay(),
            retry_jitter_ms: default_embed_jitter(),
            batch: BatchConfig::default(),
        }
    }
}

impl EmbeddingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_batch_size: default_min_batch(),
            max_batch_size: default_max_batch(),
            adaptive_enabled: true,
            target_response_secs: default_target_secs(),
            slow_threshold_secs: default_slow_secs(),
            fast_threshold_secs: default_fast_secs(),
            adjustment_cooldown_secs: default_cooldown_secs(),
            sample_window: default_sample_window(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_llm_base(),
            model: default_llm_model(),
            api_key: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            concurrency: default_completion_concurrency(),
            rpm_limit: default_llm_rpm(),
            max_retries: default_llm_retries(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            backoff_jitter_secs: default_backoff_jitter(),
            request_timeout_secs: default_request_timeout(),
            summary_prompt: default_summary_prompt(),
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Minimum spacing between two completion requests.
    pub fn min_interval(&self) -> Duration {
        if self.rpm_limit == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(60.0 / f64::from(self.rpm_limit))
        }
    }
}

impl Default for RaptorConfig {
    fn default() -> Self {
        Self {
            max_clusters: default_max_clusters(),
            similarity_threshold: default_threshold(),
            max_levels: default_max_levels(),
            random_seed: default_seed(),
            umap_n_components: default_components(),
            umap_metric: default_metric(),
            build_timeout_secs: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            llm_enabled: true,
            llm_max_size: default_llm_cache_size(),
            llm_ttl_secs: default_llm_cache_ttl(),
            embed_enabled: true,
            embed_max_size: default_embed_cache_size(),
            embed_ttl_secs: default_embed_cache_ttl(),
        }
    }
}

impl AppConfig {
    /// Fill secrets from the environment when the file left them empty.
    pub fn apply_env_overrides(&mut self) {
        if self.embedding.api_keys.is_empty() {
            if let Ok(raw) = std::env::var(EMBED_KEYS_ENV) {
                self.embedding.api_keys = parse_key_list(&raw);
            }
        }
        if self.llm.api_key.as_deref().map_or(true, str::is_empty) {
            if let Ok(key) = std::env::var(LLM_KEY_ENV) {
                self.llm.api_key = Some(key.trim().to_string());
            }
        }
    }

    pub fn validate(&self) -> RaptorResult<()> {
        let raptor = &self.raptor;
        if raptor.max_levels == 0 {
            return Err(RaptorError::Config("raptor.max_levels must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&raptor.similarity_threshold) {
            return Err(RaptorError::Config(format!(
                "raptor.similarity_threshold must be within [0, 1], got {}",
                raptor.similarity_threshold
            )));
        }
        if raptor.umap_n_components == 0 {
            return Err(RaptorError::Config("raptor.umap_n_components must be at least 1".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(RaptorError::Config("embedding.dimension must be at least 1".into()));
        }
        if self.embedding.concurrency == 0 || self.llm.concurrency == 0 {
            return Err(RaptorError::Config("concurrency limits must be at least 1".into()));
        }
        let batch = &self.embedding.batch;
        if batch.min_batch_size == 0 || batch.min_batch_size > batch.max_batch_size {
            return Err(RaptorError::Config(format!(
                "embedding.batch range [{}, {}] is invalid",
                batch.min_batch_size, batch.max_batch_size
            )));
        }
        Ok(())
    }
}

pub fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_config_path(explicit: Option<&Path>) -> RaptorResult<Option<PathBuf>> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(RaptorError::Config(format!(
            "config file {} does not exist",
            path.display()
        )));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join(CONFIG_FILE);
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(Some(candidate));
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join(CONFIG_FILE);
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(Some(candidate));
    }

    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("raptor-tree").join(CONFIG_FILE);
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in user config dir");
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

/// Load configuration from `explicit`, or from the usual locations, falling
/// back to built-in defaults. Environment secrets are applied afterwards.
pub fn load_config(explicit: Option<&Path>) -> RaptorResult<AppConfig> {
    let mut config = match resolve_config_path(explicit)? {
        Some(path) => {
            let content = std::fs::read_to_string(&path)?;
            let config: AppConfig = toml::from_str(&content)?;
            tracing::info!(path = %path.display(), model = %config.embedding.model, "config loaded");
            config
        }
        None => {
            tracing::info!("no config.toml found; using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}
