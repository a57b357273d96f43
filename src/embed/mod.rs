pub mod batch_sizer;
pub mod key_pool;
pub mod orchestrator;
pub mod packing;
pub mod rate_limiter;

pub use orchestrator::EmbeddingOrchestrator;
