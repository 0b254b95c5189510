pub mod aggregator;
pub mod classifier;
pub mod encryption;
pub mod ingest;
pub mod job;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod telegram;
