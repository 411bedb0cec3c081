// MySQL Driver
// Connector, pool factory and user store built on mysql_async

use async_trait::async_trait;
use futures::FutureExt;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Row, Value};
use std::sync::Arc;
use std::time::Instant;

use super::{elapsed_ms, require_type, VALIDATION_TIMEOUT};
use crate::db::store::UserStore;
use crate::db::traits::{
    CellValue, ConnectionFactory, DatabaseConfig, DatabaseError, DatabaseType, QueryResult,
};
use crate::model::User;
use crate::pool::ConnectionPool;

const CREATE_USERS_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
    id INT AUTO_INCREMENT PRIMARY KEY,
    username VARCHAR(50) NOT NULL UNIQUE,
    email VARCHAR(100) NOT NULL UNIQUE,
    age INT,
    city VARCHAR(50),
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP
)";

const INSERT_USER_SQL: &str =
    "INSERT IGNORE INTO users (username, email, age, city) VALUES (?, ?, ?, ?)";

/// Sessions run in UTC so timestamps read back unshifted
const SESSION_INIT_SQL: &str = "SET time_zone = '+00:00'";

/// Build driver options from config. TLS stays off.
pub fn build_opts(config: &DatabaseConfig) -> Result<Opts, DatabaseError> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| DatabaseError::InvalidConfig("Host is required".to_string()))?;
    if config.database.is_empty() {
        return Err(DatabaseError::InvalidConfig("Database name is required".to_string()));
    }
    let username = config
        .username
        .as_ref()
        .ok_or_else(|| DatabaseError::InvalidConfig("Username is required".to_string()))?;

    let builder = OptsBuilder::default()
        .ip_or_hostname(host.clone())
        .tcp_port(config.get_port())
        .db_name(Some(config.database.clone()))
        .user(Some(username.clone()))
        .pass(Some(config.password.clone()))
        .prefer_socket(false)
        .init(vec![SESSION_INIT_SQL]);

    Ok(Opts::from(builder))
}

/// `SELECT ... WHERE username IN (?, ?, ...)` with one placeholder per name
fn select_by_usernames_sql(count: usize) -> String {
    let placeholders = vec!["?"; count].join(", ");
    format!(
        "SELECT id, username, email, age, city FROM users WHERE username IN ({})",
        placeholders
    )
}

/// A live MySQL session
pub struct MySqlConnector {
    id: String,
    conn: Conn,
}

impl MySqlConnector {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let opts = build_opts(config)?;
        let conn = Conn::new(opts)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(format!("MySQL connection failed: {}", e)))?;

        tracing::info!(server = %config.describe(), "Connected to MySQL");
        Ok(Self {
            id: config.id.clone(),
            conn,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.id
    }

    /// Ping bounded by the validation timeout
    pub async fn is_alive(&mut self) -> bool {
        matches!(
            tokio::time::timeout(VALIDATION_TIMEOUT, self.conn.ping()).await,
            Ok(Ok(()))
        )
    }

    pub async fn disconnect(self) {
        if let Err(e) = self.conn.disconnect().await {
            tracing::warn!(connection = %self.id, error = %e, "Failed to close MySQL connection");
        }
    }

    /// Run a statement, returning the rows affected
    pub async fn execute(&mut self, sql: &str) -> Result<u64, DatabaseError> {
        self.conn.query_drop(sql).await?;
        Ok(self.conn.affected_rows())
    }

    pub async fn query(&mut self, sql: &str) -> Result<QueryResult, DatabaseError> {
        let start = Instant::now();
        let result: Vec<Row> = self.conn.query(sql).await?;

        let columns = result
            .first()
            .map(|row| {
                row.columns_ref()
                    .iter()
                    .map(|c| c.name_str().to_string())
                    .collect()
            })
            .unwrap_or_default();

        let rows = result
            .into_iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| cell_value_from_mysql(row.get::<Value, _>(i).unwrap_or(Value::NULL)))
                    .collect()
            })
            .collect();

        Ok(QueryResult::new(columns, rows, elapsed_ms(start)))
    }

    pub async fn create_users_table(&mut self) -> Result<(), DatabaseError> {
        self.conn.query_drop(CREATE_USERS_SQL).await?;
        Ok(())
    }

    /// Insert users one statement at a time; duplicates affect zero rows
    pub async fn insert_users(&mut self, users: &[User]) -> Result<usize, DatabaseError> {
        let mut inserted = 0;
        for user in users {
            self.conn
                .exec_drop(
                    INSERT_USER_SQL,
                    (
                        user.username.as_str(),
                        user.email.as_str(),
                        user.age,
                        user.city.as_deref(),
                    ),
                )
                .await?;
            if self.conn.affected_rows() > 0 {
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    pub async fn find_users(&mut self, usernames: &[String]) -> Result<Vec<User>, DatabaseError> {
        let sql = select_by_usernames_sql(usernames.len());
        let rows: Vec<(i64, String, String, Option<i32>, Option<String>)> =
            self.conn.exec(sql, usernames.to_vec()).await?;

        Ok(rows
            .into_iter()
            .map(|(id, username, email, age, city)| User {
                id: Some(id),
                username,
                email,
                age,
                city,
                created_at: None,
                updated_at: None,
            })
            .collect())
    }
}

fn cell_value_from_mysql(value: Value) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => CellValue::String(s),
            Err(e) => CellValue::Binary(e.into_bytes()),
        },
        Value::Int(n) => CellValue::Int(n),
        Value::UInt(n) => i64::try_from(n)
            .map(CellValue::Int)
            .unwrap_or_else(|_| CellValue::String(n.to_string())),
        Value::Float(f) => CellValue::Float(f64::from(f)),
        Value::Double(d) => CellValue::Float(d),
        Value::Date(year, month, day, hour, minute, second, micros) => CellValue::DateTime(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, minute, second, micros
        )),
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = days * 24 + u32::from(hours);
            CellValue::String(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                if negative { "-" } else { "" },
                total_hours,
                minutes,
                seconds,
                micros
            ))
        }
    }
}

/// Opens pooled MySQL connections
pub struct MySqlConnectionFactory {
    config: DatabaseConfig,
}

impl MySqlConnectionFactory {
    pub fn new(config: DatabaseConfig) -> Result<Self, DatabaseError> {
        require_type(&config, DatabaseType::Mysql)?;
        Ok(Self { config })
    }
}

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    type Connection = MySqlConnector;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mysql
    }

    async fn create(&self) -> Result<MySqlConnector, DatabaseError> {
        MySqlConnector::connect(&self.config).await
    }

    async fn is_valid(&self, conn: &mut MySqlConnector) -> bool {
        conn.is_alive().await
    }

    async fn close(&self, conn: MySqlConnector) {
        conn.disconnect().await;
    }
}

pub struct MySqlUserStore {
    pool: Arc<ConnectionPool<MySqlConnectionFactory>>,
}

impl MySqlUserStore {
    pub fn new(pool: Arc<ConnectionPool<MySqlConnectionFactory>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<MySqlConnectionFactory>> {
        &self.pool
    }
}

#[async_trait]
impl UserStore for MySqlUserStore {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mysql
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
