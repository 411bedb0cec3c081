// Application Configuration
// Typed settings read from environment variables

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::db::traits::{DatabaseConfig, DatabaseError, DatabaseType};
use crate::logging::LogFormat;
use crate::pool::{PoolConfig, WorkerPoolConfig};
use crate::service::DEFAULT_BATCH_TIMEOUT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(String),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mysql: Option<DatabaseConfig>,
    pub postgres: Option<DatabaseConfig>,
    pub mongodb: Option<DatabaseConfig>,
    pub neo4j: Option<DatabaseConfig>,
    pub pool: PoolConfig,
    pub workers: WorkerPoolConfig,
    pub batch_timeout: Duration,
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings from a fixed map
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    /// Read settings through an arbitrary key lookup.
    ///
    /// A vendor section is enabled by its host, URI or connection string;
    /// once enabled, its other keys must be present.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Settings { lookup };

        let pool_defaults = PoolConfig::default();
        let pool = PoolConfig {
            max_size: env.parse_or("DB_POOL_MAX_SIZE", pool_defaults.max_size)?,
            acquire_timeout: env.secs_or("DB_POOL_ACQUIRE_TIMEOUT_SECS", pool_defaults.acquire_timeout)?,
            ..pool_defaults
        };

        let worker_defaults = WorkerPoolConfig::default();
        let workers = WorkerPoolConfig {
            core_workers: env.parse_or("DB_WORKERS_CORE", worker_defaults.core_workers)?,
            max_workers: env.parse_or("DB_WORKERS_MAX", worker_defaults.max_workers)?,
            queue_capacity: env.parse_or("DB_WORKERS_QUEUE_CAPACITY", worker_defaults.queue_capacity)?,
            shutdown_timeout: env.secs_or("DB_WORKERS_SHUTDOWN_TIMEOUT_SECS", worker_defaults.shutdown_timeout)?,
        };
        if workers.max_workers == 0 {
            return Err(ConfigError::Invalid {
                key: "DB_WORKERS_MAX".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            mysql: env.sql_section("MYSQL", DatabaseType::Mysql)?,
            postgres: env.sql_section("POSTGRES", DatabaseType::Postgresql)?,
            mongodb: env.mongo_section()?,
            neo4j: env.neo4j_section()?,
            pool,
            workers,
            batch_timeout: env.secs_or("DB_BATCH_TIMEOUT_SECS", DEFAULT_BATCH_TIMEOUT)?,
            log_format: env.parse_or("LOG_FORMAT", LogFormat::default())?,
        })
    }
}

struct Settings<F> {
    lookup: F,
}

impl<F> Settings<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Value for `key`, treating blank as unset
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    key: key.to_string(),
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    fn secs_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs).unwrap_or(default))
    }

    fn sql_section(&self, prefix: &str, database_type: DatabaseType) -> Result<Option<DatabaseConfig>, ConfigError> {
        let key = |name: &str| format!("{}_{}", prefix, name);
        let Some(host) = self.get(&key("HOST")) else {
            return Ok(None);
        };

        let mut config = DatabaseConfig::new(database_type.display_name().to_string(), database_type);
        config.host = Some(host);
        config.port = self.parse(&key("PORT"))?;
        config.database = self.require(&key("DATABASE"))?;
        config.username = Some(self.require(&key("USERNAME"))?);
        config.password = self.require(&key("PASSWORD"))?;
        if database_type == DatabaseType::Postgresql {
            config.postgres_sslmode = self.get(&key("SSLMODE"));
        }

        config.validate()?;
        Ok(Some(config))
    }

    fn mongo_section(&self) -> Result<Option<DatabaseConfig>, ConfigError> {
        let Some(uri) = self.get("MONGODB_CONNECTION_STRING") else {
            return Ok(None);
        };

        let mut config = DatabaseConfig::new("MongoDB".to_string(), DatabaseType::Mongodb);
        config.connection_uri = Some(uri);
        config.database = self.require("MONGODB_DATABASE_NAME")?;
        config.collection = Some(self.require("MONGODB_COLLECTION_NAME")?);

        config.validate()?;
        Ok(Some(config))
    }

    fn neo4j_section(&self) -> Result<Option<DatabaseConfig>, ConfigError> {
        let Some(uri) = self.get("NEO4J_URI") else {
            return Ok(None);
        };

        let mut config = DatabaseConfig::new("Neo4j".to_string(), DatabaseType::Neo4j);
        config.connection_uri = Some(uri);
        config.username = Some(self.require("NEO4J_USERNAME")?);
        config.password = self.require("NEO4J_PASSWORD")?;

        config.validate()?;
        Ok(Some(config))
    }
}
