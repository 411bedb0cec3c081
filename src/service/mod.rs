// Service Layer
// Batch operations fanned out over the shared worker pool

pub mod concurrent;

pub use concurrent::{plan_shards, ConcurrentDatabaseService, DEFAULT_BATCH_TIMEOUT};
