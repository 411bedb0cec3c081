// User Store
// Batch persistence of users, implemented per vendor on top of a connection pool

use async_trait::async_trait;

use crate::db::traits::{DatabaseError, DatabaseType};
use crate::model::User;

#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    fn database_type(&self) -> DatabaseType;

    /// Create the users table or indexes if they are missing
    async fn ensure_schema(&self) -> Result<(), DatabaseError>;

    /// Insert users, skipping ones whose username or email already exists.
    /// Returns how many rows were actually inserted.
    async fn insert_batch(&self, users: Vec<User>) -> Result<usize, DatabaseError>;

    async fn find_by_usernames(&self, usernames: Vec<String>) -> Result<Vec<User>, DatabaseError>;

    /// Release any pooled connections
    async fn close(&self) {}
}
