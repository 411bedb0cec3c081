// Database Drivers
// One connector per vendor, each with a pool factory; the SQL and document
// vendors also provide a user store

use std::time::{Duration, Instant};

use crate::db::traits::{DatabaseConfig, DatabaseError, DatabaseType};

pub mod mongo;
pub mod mysql;
pub mod neo4j;
pub mod postgres;

pub use mongo::{MongoConnectionFactory, MongoConnector, MongoUserStore};
pub use mysql::{MySqlConnectionFactory, MySqlConnector, MySqlUserStore};
pub use neo4j::{Neo4jConnectionFactory, Neo4jConnector};
pub use postgres::{PostgresConnectionFactory, PostgresConnector, PostgresUserStore};

/// Upper bound on a liveness round trip
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Reject configs meant for another vendor, then run the usual validation
pub(crate) fn require_type(config: &DatabaseConfig, expected: DatabaseType) -> Result<(), DatabaseError> {
    if config.database_type != expected {
        return Err(DatabaseError::InvalidConfig(format!(
            "Expected a {} configuration, got {}",
            expected, config.database_type
        )));
    }
    config.validate()
}
