// Database Module
// Shared types, per-vendor connectors and the user store abstraction

pub mod drivers;
pub mod store;
pub mod traits;

pub use drivers::{
    MongoConnectionFactory, MongoConnector, MongoUserStore, MySqlConnectionFactory,
    MySqlConnector, MySqlUserStore, Neo4jConnectionFactory, Neo4jConnector,
    PostgresConnectionFactory, PostgresConnector, PostgresUserStore,
};
pub use store::UserStore;
pub use traits::{
    CellValue, ConnectionFactory, DatabaseConfig, DatabaseError, DatabaseType, QueryResult,
};
