// Pooling: bounded connection pool and the shared worker pool

pub mod connection_pool;
pub mod worker_pool;

pub use connection_pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use worker_pool::{TaskHandle, WorkerPool, WorkerPoolConfig};
