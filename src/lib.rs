// multidb-client
// Native-driver connectors for MySQL, PostgreSQL, MongoDB and Neo4j, a bounded
// connection pool, a shared worker pool and a service that fans user batches
// out across workers.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod pool;
pub mod service;

pub use config::{AppConfig, ConfigError};
pub use db::{DatabaseConfig, DatabaseError, DatabaseType, UserStore};
pub use model::User;
pub use pool::{ConnectionPool, PoolConfig, WorkerPool, WorkerPoolConfig};
pub use service::ConcurrentDatabaseService;
