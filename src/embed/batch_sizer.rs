//! Latency-driven batch sizing, tracked per provider.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::BatchConfig;

const MIN_SAMPLES: usize = 3;

struct ProviderBatchState {
    current: usize,
    samples: VecDeque<f64>,
    last_adjustment: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub current_batch_size: usize,
    pub samples: usize,
    pub avg_response_secs: Option<f64>,
}

pub struct AdaptiveBatchSizer {
    config: BatchConfig,
    providers: Mutex<HashMap<String, ProviderBatchState>>,
}

impl AdaptiveBatchSizer {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Batch size to use for `pending` texts on `provider`.
    pub fn batch_size(&self, provider: &str, pending: usize) -> usize {
        let base = if self.config.adaptive_enabled {
            let mut providers = self.lock();
            self.entry(&mut providers, provider).current
        } else {
            self.config.batch_size
        };
        base.min(pending).max(1)
    }

    /// Record one call. Failures count at double latency. Returns the new batch
    /// size when this sample triggered an adjustment.
    pub fn record(&self, provider: &str, latency: Duration, success: bool) -> Option<usize> {
        if !self.config.adaptive_enabled {
            return None;
        }
        let mut secs = latency.as_secs_f64();
        if !success {
            secs *= 2.0;
        }

        let mut providers = self.lock();
        let window = self.config.sample_window.max(1);
        let cooldown = Duration::from_secs(self.config.adjustment_cooldown_secs);
        let state = self.entry(&mut providers, provider);
        if state.samples.len() == window {
            state.samples.pop_front();
        }
        state.samples.push_back(secs);

        if state.samples.len() < MIN_SAMPLES || state.last_adjustment.elapsed() < cooldown {
            return None;
        }

        let avg = state.samples.iter().sum::<f64>() / state.samples.len() as f64;
        let step = adjustment(&self.config, avg);
        if step == 0 {
            return None;
        }
        let next = (state.current as i64 + step)
            .clamp(self.config.min_batch_size as i64, self.config.max_batch_size as i64)
            as usize;
        if next == state.current {
            return None;
        }

        tracing::info!(
            provider,
            from = state.current,
            to = next,
            avg_response_secs = avg,
            "batch size adjusted"
        );
        state.current = next;
        state.last_adjustment = Instant::now();
        state.samples.clear();
        Some(next)
    }

    pub fn stats(&self, provider: &str) -> BatchStats {
        let mut providers = self.lock();
        let state = self.entry(&mut providers, provider);
        let avg = (!state.samples.is_empty())
            .then(|| state.samples.iter().sum::<f64>() / state.samples.len() as f64);
        BatchStats {
            current_batch_size: state.current,
            samples: state.samples.len(),
            avg_response_secs: avg,
        }
    }

    fn entry<'a>(
        &self,
        providers: &'a mut HashMap<String, ProviderBatchState>,
        provider: &str,
    ) -> &'a mut ProviderBatchState {
        providers
            .entry(provider.to_string())
            .or_insert_with(|| ProviderBatchState {
                current: self
                    .config
                    .batch_size
                    .clamp(self.config.min_batch_size, self.config.max_batch_size),
                samples: VecDeque::with_capacity(self.config.sample_window),
                last_adjustment: Instant::now(),
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProviderBatchState>> {
        self.providers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn adjustment(config: &BatchConfig, avg: f64) -> i64 {
    let target = config.target_response_secs;
    if avg > config.slow_threshold_secs {
        -4
    } else if avg > target * 1.5 {
        -2
    } else if avg < config.fast_threshold_secs {
        4
    } else if avg < target * 0.7 {
        2
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> AdaptiveBatchSizer {
        AdaptiveBatchSizer::new(BatchConfig::default())
    }

    #[test]
    fn adjustment_table() {
        let cfg = BatchConfig::default();
        assert_eq!(adjustment(&cfg, 5.0), -4);
        assert_eq!(adjustment(&cfg, 3.5), -2);
        assert_eq!(adjustment(&cfg, 0.5), 4);
        assert_eq!(adjustment(&cfg, 1.2), 2);
        assert_eq!(adjustment(&cfg, 2.0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_early_adjustment() {
        let sizer = sizer();
        for _ in 0..5 {
            assert_eq!(sizer.record("voyage", Duration::from_secs(6), true), None);
        }
        assert_eq!(sizer.batch_size("voyage", 100), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_responses_shrink_batch_and_reset_window() {
        let sizer = sizer();
        sizer.batch_size("voyage", 100);
        tokio::time::advance(Duration::from_secs(31)).await;
        sizer.record("voyage", Duration::from_secs(5), true);
        sizer.record("voyage", Duration::from_secs(5), true);
        assert_eq!(sizer.record("voyage", Duration::from_secs(5), true), Some(8));
        assert_eq!(sizer.stats("voyage").samples, 0);
        assert_eq!(sizer.batch_size("voyage", 100), 8);
        assert_eq!(sizer.batch_size("voyage", 3), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_count_double() {
        let sizer = sizer();
        sizer.batch_size("voyage", 100);
        tokio::time::advance(Duration::from_secs(31)).await;
        // 2.5s doubled to 5s exceeds the slow threshold.
        sizer.record("voyage", Duration::from_millis(2_500), false);
        sizer.record("voyage", Duration::from_millis(2_500), false);
        assert_eq!(sizer.record("voyage", Duration::from_millis(2_500), false), Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn clamped_to_bounds() {
        let sizer = sizer();
        sizer.batch_size("fast", 100);
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(31)).await;
            for _ in 0..3 {
                sizer.record("fast", Duration::from_millis(100), true);
            }
        }
        assert_eq!(sizer.batch_size("fast", 100), 24);
    }

    #[test]
    fn disabled_uses_fixed_size() {
        let sizer = AdaptiveBatchSizer::new(BatchConfig {
            adaptive_enabled: false,
            batch_size: 7,
            ..BatchConfig::default()
        });
        assert_eq!(sizer.record("x", Duration::from_secs(10), false), None);
        assert_eq!(sizer.batch_size("x", 100), 7);
    }
}
