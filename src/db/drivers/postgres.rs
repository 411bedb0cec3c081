// PostgreSQL Driver
// Connector, pool factory and user store built on tokio-postgres

use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row, SimpleQueryMessage};

use super::{elapsed_ms, require_type, VALIDATION_TIMEOUT};
use crate::db::store::UserStore;
use crate::db::traits::{
    CellValue, ConnectionFactory, DatabaseConfig, DatabaseError, DatabaseType, QueryResult,
};
use crate::model::User;
use crate::pool::ConnectionPool;

const CREATE_USERS_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
    id SERIAL PRIMARY KEY,
    username VARCHAR(50) NOT NULL UNIQUE,
    email VARCHAR(100) NOT NULL UNIQUE,
    age INT,
    city VARCHAR(50),
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)";

const INSERT_USER_SQL: &str = "INSERT INTO users (username, email, age, city, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP) \
     ON CONFLICT (username) DO NOTHING";

const SELECT_USERS_SQL: &str = "SELECT id, username, email, age, city, created_at, updated_at \
     FROM users WHERE username = ANY($1)";

/// Build PostgreSQL connection string from config
pub fn build_connection_string(config: &DatabaseConfig) -> Result<String, DatabaseError> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| DatabaseError::InvalidConfig("Host is required".to_string()))?;
    let port = config.get_port();
    let database = if config.database.is_empty() {
        return Err(DatabaseError::InvalidConfig("Database name is required".to_string()));
    } else {
        config.database.clone()
    };
    let username = config
        .username
        .as_ref()
        .ok_or_else(|| DatabaseError::InvalidConfig("Username is required".to_string()))?;
    let password = &config.password;
    let sslmode = config.postgres_sslmode.as_deref().unwrap_or("prefer");

    Ok(format!(
        "host={} port={} dbname={} user={} password={} sslmode={}",
        host, port, database, username, password, sslmode
    ))
}

/// A live PostgreSQL session
pub struct PostgresConnector {
    id: String,
    client: Client,
    driver: JoinHandle<()>,
}

impl PostgresConnector {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let conn_string = build_connection_string(config)?;

        let (client, connection) = tokio_postgres::connect(&conn_string, NoTls)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(format!("PostgreSQL connection failed: {}", e)))?;

        // The connection object drives the socket and must be polled separately
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "PostgreSQL connection terminated with error");
            }
        });

        tracing::info!(server = %config.describe(), "Connected to PostgreSQL");
        Ok(Self {
            id: config.id.clone(),
            client,
            driver,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.id
    }

    /// Round-trip check bounded by the validation timeout
    pub async fn is_alive(&self) -> bool {
        if self.client.is_closed() {
            return false;
        }
        matches!(
            tokio::time::timeout(VALIDATION_TIMEOUT, self.client.simple_query("SELECT 1")).await,
            Ok(Ok(_))
        )
    }

    pub async fn disconnect(self) {
        let Self { id, client, driver } = self;
        drop(client);
        if tokio::time::timeout(VALIDATION_TIMEOUT, driver).await.is_err() {
            tracing::warn!(connection = %id, "PostgreSQL connection did not close in time");
        }
        tracing::debug!(connection = %id, "PostgreSQL connection closed");
    }

    /// Run one or more statements, returning the total rows affected
    pub async fn execute(&self, sql: &str) -> Result<u64, DatabaseError> {
        let messages = self.client.simple_query(sql).await?;
        Ok(messages
            .iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::CommandComplete(rows) => Some(*rows),
                _ => None,
            })
            .sum())
    }

    /// Run a query and return every row as text cells
    pub async fn query(&self, sql: &str) -> Result<QueryResult, DatabaseError> {
        let start = Instant::now();
        let messages = self.client.simple_query(sql).await?;

        let mut columns = Vec::new();
        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if columns.is_empty() {
                    columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                rows.push((0..row.len()).map(|i| text_cell(row.get(i))).collect());
            }
        }

        Ok(QueryResult::new(columns, rows, elapsed_ms(start)))
    }

    pub async fn create_users_table(&self) -> Result<(), DatabaseError> {
        self.client.batch_execute(CREATE_USERS_SQL).await?;
        Ok(())
    }

    /// Insert users in one transaction, ignoring username conflicts
    pub async fn insert_users(&mut self, users: &[User]) -> Result<usize, DatabaseError> {
        let tx = self.client.transaction().await?;
        let statement = tx.prepare(INSERT_USER_SQL).await?;

        let mut inserted = 0u64;
        for user in users {
            inserted += tx
                .execute(&statement, &[&user.username, &user.email, &user.age, &user.city])
                .await?;
        }
        tx.commit().await?;

        Ok(inserted as usize)
    }

    pub async fn find_users(&self, usernames: &[String]) -> Result<Vec<User>, DatabaseError> {
        let rows = self.client.query(SELECT_USERS_SQL, &[&usernames]).await?;
        rows.iter()
            .map(|row| user_from_row(row).map_err(DatabaseError::from))
            .collect()
    }
}

fn text_cell(value: Option<&str>) -> CellValue {
    value.map_or(CellValue::Null, |v| CellValue::String(v.to_string()))
}

fn user_from_row(row: &Row) -> Result<User, tokio_postgres::Error> {
    let id: i32 = row.try_get("id")?;
    Ok(User {
        id: Some(i64::from(id)),
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        age: row.try_get("age")?,
        city: row.try_get("city")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Opens pooled PostgreSQL connections
pub struct PostgresConnectionFactory {
    config: DatabaseConfig,
}

impl PostgresConnectionFactory {
    pub fn new(config: DatabaseConfig) -> Result<Self, DatabaseError> {
        require_type(&config, DatabaseType::Postgresql)?;
        Ok(Self { config })
    }
}

#[async_trait]
impl ConnectionFactory for PostgresConnectionFactory {
    type Connection = PostgresConnector;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgresql
    }

    async fn create(&self) -> Result<PostgresConnector, DatabaseError> {
        PostgresConnector::connect(&self.config).await
    }

    async fn is_valid(&self, conn: &mut PostgresConnector) -> bool {
        conn.is_alive().await
    }

    async fn close(&self, conn: PostgresConnector) {
        conn.disconnect().await;
    }
}

pub struct PostgresUserStore {
    pool: Arc<ConnectionPool<PostgresConnectionFactory>>,
}

impl PostgresUserStore {
    pub fn new(pool: Arc<ConnectionPool<PostgresConnectionFactory>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<PostgresConnectionFactory>> {
        &self.pool
    }
}

#[async_trait]
impl UserStore for PostgresUserStore {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgresql
    }

    async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        self.pool
            .with_connection(|conn| async move { conn.create_users_table().await }.boxed())
            .await
    }

    async fn insert_batch(&self, users: Vec<User>) -> Result<usize, DatabaseError> {
        if users.is_empty() {
            return Ok(0);
        }
        self.pool
            .with_connection(move |conn| async move { conn.insert_users(&users).await }.boxed())
            .await
    }

    async fn find_by_usernames(&self, usernames: Vec<String>) -> Result<Vec<User>, DatabaseError> {
        if usernames.is_empty() {
            return Ok(Vec::new());
        }
        self.pool
            .with_connection(move |conn| async move { conn.find_users(&usernames).await }.boxed())
            .await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
