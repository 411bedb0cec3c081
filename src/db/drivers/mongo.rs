// MongoDB Driver
// Connector, pool factory and user store built on the official mongodb crate

use async_trait::async_trait;
use futures::{FutureExt, TryStreamExt};
use mongodb::bson::{doc, Document};
use mongodb::error::ErrorKind;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use std::sync::Arc;

use super::{require_type, VALIDATION_TIMEOUT};
use crate::db::store::UserStore;
use crate::db::traits::{ConnectionFactory, DatabaseConfig, DatabaseError, DatabaseType};
use crate::model::User;
use crate::pool::ConnectionPool;

const DUPLICATE_KEY: i32 = 11000;

/// Connection string from config: the explicit URI wins, otherwise one is
/// assembled from host, port and credentials
pub fn build_connection_uri(config: &DatabaseConfig) -> Result<String, DatabaseError> {
    if let Some(uri) = config.connection_uri.as_deref().filter(|u| !u.trim().is_empty()) {
        return Ok(uri.to_string());
    }

    let host = config
        .host
        .as_ref()
        .ok_or_else(|| DatabaseError::InvalidConfig("Connection string or host is required".to_string()))?;
    let credentials = match config.username.as_deref() {
        Some(user) if !user.is_empty() => format!("{}:{}@", user, config.password),
        _ => String::new(),
    };

    Ok(format!("mongodb://{}{}:{}", credentials, host, config.get_port()))
}

/// A client bound to one database and users collection
pub struct MongoConnector {
    client: Client,
    database: Database,
    collection_name: String,
}

impl MongoConnector {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let uri = build_connection_uri(config)?;
        let client = Client::with_uri_str(&uri)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(format!("MongoDB connection failed: {}", e)))?;

        let database = client.database(&config.database);
        let collection_name = config
            .collection
            .clone()
            .ok_or_else(|| DatabaseError::InvalidConfig("Collection name is required".to_string()))?;

        tracing::info!(
            server = %config.describe(),
            database = %config.database,
            collection = %collection_name,
            "Connected to MongoDB"
        );
        Ok(Self {
            client,
            database,
            collection_name,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn users(&self) -> Collection<User> {
        self.database.collection(&self.collection_name)
    }

    /// `ping` bounded by the validation timeout
    pub async fn is_alive(&self) -> bool {
        matches!(
            tokio::time::timeout(VALIDATION_TIMEOUT, self.run_command(doc! { "ping": 1 })).await,
            Ok(Ok(_))
        )
    }

    pub async fn disconnect(self) {
        self.client.shutdown().await;
        tracing::debug!(database = %self.database.name(), "MongoDB client shut down");
    }

    /// Run a raw database command
    pub async fn run_command(&self, command: Document) -> Result<Document, DatabaseError> {
        Ok(self.database.run_command(command).await?)
    }

    pub async fn count_users(&self) -> Result<u64, DatabaseError> {
        Ok(self.users().count_documents(doc! {}).await?)
    }

    /// Unique indexes on username and email, plus a plain one on age
    pub async fn create_user_indexes(&self) -> Result<(), DatabaseError> {
        let unique = || IndexOptions::builder().unique(true).build();
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "username": 1 })
                .options(unique())
                .build(),
            IndexModel::builder()
                .keys(doc! { "email": 1 })
                .options(unique())
                .build(),
            IndexModel::builder().keys(doc! { "age": 1 }).build(),
        ];
        self.users().create_indexes(indexes).await?;
        Ok(())
    }

    /// Unordered insert; documents rejected as duplicates are not counted
    pub async fn insert_users(&self, users: &[User]) -> Result<usize, DatabaseError> {
        let err = match self.users().insert_many(users).ordered(false).await {
            Ok(result) => return Ok(result.inserted_ids.len()),
            Err(err) => err,
        };

        match rejected_duplicates(&err.kind) {
            Some(duplicates) => {
                tracing::debug!(duplicates, "Skipped duplicate MongoDB documents");
                Ok(users.len().saturating_sub(duplicates))
            }
            None => Err(err.into()),
        }
    }

    pub async fn find_users(&self, usernames: &[String]) -> Result<Vec<User>, DatabaseError> {
        let cursor = self
            .users()
            .find(doc! { "username": { "$in": usernames.to_vec() } })
            .await?;
        Ok(cursor.try_collect().await?)
    }
}

/// Duplicates rejected by a failed unordered insert, or `None` when the
/// failure was anything else
fn rejected_duplicates(kind: &ErrorKind) -> Option<usize> {
    let ErrorKind::InsertMany(failure) = kind else {
        return None;
    };
    let codes: Vec<i32> = failure
        .write_errors
        .iter()
        .flatten()
        .map(|e| e.code)
        .collect();
    duplicate_count(&codes, failure.write_concern_error.is_some())
}

/// Every write error must be a duplicate key and the write concern must
/// have held
fn duplicate_count(write_error_codes: &[i32], write_concern_failed: bool) -> Option<usize> {
    if write_concern_failed || write_error_codes.is_empty() {
        return None;
    }
    write_error_codes
        .iter()
        .all(|&code| code == DUPLICATE_KEY)
        .then_some(write_error_codes.len())
}

/// Opens pooled MongoDB clients
pub struct MongoConnectionFactory {
    config: DatabaseConfig,
}

impl MongoConnectionFactory {
    pub fn new(config: DatabaseConfig) -> Result<Self, DatabaseError> {
        require_type(&config, DatabaseType::Mongodb)?;
        Ok(Self { config })
    }
}

#[async_trait]
impl ConnectionFactory for MongoConnectionFactory {
    type Connection = MongoConnector;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mongodb
    }

    async fn create(&self) -> Result<MongoConnector, DatabaseError> {
        MongoConnector::connect(&self.config).await
    }

    async fn is_valid(&self, conn: &mut MongoConnector) -> bool {
        conn.is_alive().await
    }

    async fn close(&self, conn: MongoConnector) {
        conn.disconnect().await;
    }
}

pub struct MongoUserStore {
    pool: Arc<ConnectionPool<MongoConnectionFactory>>,
}

impl MongoUserStore {
    pub fn new(pool: Arc<ConnectionPool<MongoConnectionFactory>>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<MongoConnectionFactory>> {
        &self.pool
    }
}

#[async_trait]
impl UserStore for MongoUserStore {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mongodb
    }

    async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        self.pool
            .with_connection(|conn| async move { conn.create_user_indexes().await }.boxed())
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
