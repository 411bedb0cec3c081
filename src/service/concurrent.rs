// Concurrent Database Service
// Splits user batches into shards and runs one shard per worker

use futures::future::join_all;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::db::drivers::{
    MongoConnectionFactory, MongoUserStore, MySqlConnectionFactory, MySqlUserStore,
    PostgresConnectionFactory, PostgresUserStore,
};
use crate::db::store::UserStore;
use crate::db::traits::{DatabaseError, DatabaseType};
use crate::model::User;
use crate::pool::{ConnectionPool, WorkerPool};

pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Split `len` items into at most `thread_count` contiguous shards.
///
/// Shards are `len / n` long; the last one also takes the remainder. A
/// thread count of zero still yields one shard for a non-empty batch.
pub fn plan_shards(len: usize, thread_count: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let shards = thread_count.min(len);
    if shards == 0 {
        return vec![0..len];
    }

    let size = len / shards;
    (0..shards)
        .map(|i| {
            let end = if i == shards - 1 { len } else { (i + 1) * size };
            i * size..end
        })
        .collect()
}

/// Cut `items` into owned chunks following `shards`
fn split_into<T>(mut items: Vec<T>, shards: &[Range<usize>]) -> Vec<Vec<T>> {
    let mut chunks: Vec<Vec<T>> = shards
        .iter()
        .rev()
        .map(|range| items.split_off(range.start))
        .collect();
    chunks.reverse();
    chunks
}

pub struct ConcurrentDatabaseService {
    workers: Arc<WorkerPool>,
    mysql: Option<Arc<dyn UserStore>>,
    postgres: Option<Arc<dyn UserStore>>,
    mongo: Option<Arc<dyn UserStore>>,
    batch_timeout: Duration,
}

impl ConcurrentDatabaseService {
    pub fn new(workers: Arc<WorkerPool>) -> Self {
        Self {
            workers,
            mysql: None,
            postgres: None,
            mongo: None,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }

    /// Service backed by the process-wide worker pool
    pub fn with_global_workers() -> Self {
        Self::new(WorkerPool::global())
    }

    /// Build pools and stores for every configured vendor.
    ///
    /// Connections open lazily, so this never touches the network.
    pub fn from_config(config: &AppConfig) -> Result<Self, DatabaseError> {
        if !WorkerPool::init_global(config.workers.clone()) {
            tracing::warn!("Worker pool already initialized, keeping its existing configuration");
        }
        let mut service = Self::with_global_workers().with_batch_timeout(config.batch_timeout);

        if let Some(mysql) = &config.mysql {
            let factory = MySqlConnectionFactory::new(mysql.clone())?;
            let pool = Arc::new(ConnectionPool::new(factory, config.pool.clone()));
            service = service.with_mysql(Arc::new(MySqlUserStore::new(pool)));
        }
        if let Some(postgres) = &config.postgres {
            let factory = PostgresConnectionFactory::new(postgres.clone())?;
            let pool = Arc::new(ConnectionPool::new(factory, config.pool.clone()));
            service = service.with_postgres(Arc::new(PostgresUserStore::new(pool)));
        }
        if let Some(mongo) = &config.mongodb {
            let factory = MongoConnectionFactory::new(mongo.clone())?;
            let pool = Arc::new(ConnectionPool::new(factory, config.pool.clone()));
            service = service.with_mongo(Arc::new(MongoUserStore::new(pool)));
        }

        Ok(service)
    }

    pub fn with_mysql(mut self, store: Arc<dyn UserStore>) -> Self {
        self.mysql = Some(store);
        self
    }

    pub fn with_postgres(mut self, store: Arc<dyn UserStore>) -> Self {
        self.postgres = Some(store);
        self
    }

    pub fn with_mongo(mut self, store: Arc<dyn UserStore>) -> Self {
        self.mongo = Some(store);
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }

    /// Store registered for `database_type`
    pub fn store(&self, database_type: DatabaseType) -> Result<Arc<dyn UserStore>, DatabaseError> {
        let store = match database_type {
            DatabaseType::Mysql => self.mysql.as_ref(),
            DatabaseType::Postgresql => self.postgres.as_ref(),
            DatabaseType::Mongodb => self.mongo.as_ref(),
            DatabaseType::Neo4j => None,
        };
        store
            .cloned()
            .ok_or(DatabaseError::NotConfigured(database_type))
    }

    /// Insert `users` across up to `thread_count` workers.
    ///
    /// Returns the number of rows inserted by the shards that succeeded.
    pub async fn concurrent_insert(
        &self,
        store: Arc<dyn UserStore>,
        users: Vec<User>,
        thread_count: usize,
    ) -> Result<usize, DatabaseError> {
        let database_type = store.database_type();
        let start = Instant::now();

        let counts = self
            .fan_out("insert", database_type, users, thread_count, move |chunk| {
                let store = Arc::clone(&store);
                async move { store.insert_batch(chunk).await }
            })
            .await?;
        let inserted = counts.into_iter().sum();

        tracing::info!(
            database = %database_type,
            inserted,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Concurrent insert finished"
        );
        Ok(inserted)
    }

    /// Look up `usernames` across up to `thread_count` workers.
    ///
    /// Results from all shards are merged in no particular order.
    pub async fn concurrent_query(
        &self,
        store: Arc<dyn UserStore>,
        usernames: Vec<String>,
        thread_count: usize,
    ) -> Result<Vec<User>, DatabaseError> {
        let database_type = store.database_type();
        let start = Instant::now();

        let batches = self
            .fan_out("query", database_type, usernames, thread_count, move |chunk| {
                let store = Arc::clone(&store);
                async move { store.find_by_usernames(chunk).await }
            })
            .await?;
        let users: Vec<User> = batches.into_iter().flatten().collect();

        tracing::info!(
            database = %database_type,
            found = users.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Concurrent query finished"
        );
        Ok(users)
    }

    pub async fn concurrent_mysql_insert(
        &self,
        users: Vec<User>,
        thread_count: usize,
    ) -> Result<usize, DatabaseError> {
        let store = self.store(DatabaseType::Mysql)?;
        self.concurrent_insert(store, users, thread_count).await
    }

    pub async fn concurrent_postgres_insert(
        &self,
        users: Vec<User>,
        thread_count: usize,
    ) -> Result<usize, DatabaseError> {
        let store = self.store(DatabaseType::Postgresql)?;
        self.concurrent_insert(store, users, thread_count).await
    }

    pub async fn concurrent_mongo_insert(
        &self,
        users: Vec<User>,
        thread_count: usize,
    ) -> Result<usize, DatabaseError> {
        let store = self.store(DatabaseType::Mongodb)?;
        self.concurrent_insert(store, users, thread_count).await
    }

    /// Look up the MySQL rows matching the usernames of `users`
    pub async fn concurrent_mysql_query(
        &self,
        users: &[User],
        thread_count: usize,
    ) -> Result<Vec<User>, DatabaseError> {
        let store = self.store(DatabaseType::Mysql)?;
        let usernames = users.iter().map(|u| u.username.clone()).collect();
        self.concurrent_query(store, usernames, thread_count).await
    }

    pub async fn concurrent_postgres_query(
        &self,
        usernames: Vec<String>,
        thread_count: usize,
    ) -> Result<Vec<User>, DatabaseError> {
        let store = self.store(DatabaseType::Postgresql)?;
        self.concurrent_query(store, usernames, thread_count).await
    }

    pub async fn concurrent_mongo_query(
        &self,
        usernames: Vec<String>,
        thread_count: usize,
    ) -> Result<Vec<User>, DatabaseError> {
        let store = self.store(DatabaseType::Mongodb)?;
        self.concurrent_query(store, usernames, thread_count).await
    }

    /// Shut the worker pool down, then close every store's connections
    pub async fn shutdown(&self) {
        self.workers.shutdown().await;
        for store in [&self.mysql, &self.postgres, &self.mongo].into_iter().flatten() {
            store.close().await;
        }
    }

    /// Run `run` once per shard on the worker pool and collect the outputs of
    /// the shards that succeeded. Failed shards are logged and skipped.
    async fn fan_out<I, O, F, Fut>(
        &self,
        operation: &'static str,
        database_type: DatabaseType,
        items: Vec<I>,
        thread_count: usize,
        run: F,
    ) -> Result<Vec<O>, DatabaseError>
    where
        F: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<O, DatabaseError>> + Send + 'static,
        O: Send + 'static,
    {
        if self.workers.is_shutdown() {
            return Err(DatabaseError::WorkerPoolShutdown);
        }

        let shards = plan_shards(items.len(), thread_count);
        tracing::debug!(
            database = %database_type,
            operation,
            items = items.len(),
            shards = shards.len(),
            "Planning concurrent batch"
        );

        let mut handles = Vec::with_capacity(shards.len());
        for (shard, chunk) in split_into(items, &shards).into_iter().enumerate() {
            // A shutdown racing this loop leaves the shards already submitted
            // to be joined below
            match self.workers.submit(run(chunk)) {
                Ok(handle) => handles.push((shard, handle)),
                Err(e) => {
                    tracing::error!(
                        database = %database_type,
                        operation,
                        shard,
                        error = %e,
                        "Shard was not scheduled"
                    );
                }
            }
        }

        let joined = join_all(
            handles
                .into_iter()
                .map(|(shard, handle)| async move { (shard, handle.join().await) }),
        );
        let results = tokio::time::timeout(self.batch_timeout, joined)
            .await
            .map_err(|_| {
                tracing::error!(
                    database = %database_type,
                    operation,
                    timeout_ms = self.batch_timeout.as_millis() as u64,
                    "Concurrent batch timed out"
                );
                DatabaseError::Timeout
            })?;

        let mut outputs = Vec::with_capacity(results.len());
        for (shard, result) in results {
            match result {
                Ok(Ok(output)) => {
                    tracing::debug!(database = %database_type, operation, shard, "Shard completed");
                    outputs.push(output);
                }
                Ok(Err(e)) | Err(e) => {
                    tracing::error!(
                        database = %database_type,
                        operation,
                        shard,
                        error = %e,
                        "Shard failed"
                    );
                }
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::traits::ConnectionFactory;
    use crate::pool::{PoolConfig, PoolStats, WorkerPoolConfig};
    use async_trait::async_trait;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory store that records every call
    #[derive(Default)]
    struct MockStore {
        calls: AtomicUsize,
        shard_sizes: Mutex<Vec<usize>>,
        fail_username: Option<String>,
        delay: Option<Duration>,
        closed: AtomicBool,
    }

    impl MockStore {
        fn failing_on(username: &str) -> Self {
            Self {
                fail_username: Some(username.to_string()),
                ..Default::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        async fn record(&self, names: &[&str]) -> Result<(), DatabaseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.shard_sizes.lock().push(names.len());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.fail_username {
                Some(bad) if names.contains(&bad.as_str()) => {
                    Err(DatabaseError::QueryError(format!("duplicate {}", bad)))
                }
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl UserStore for MockStore {
        fn database_type(&self) -> DatabaseType {
            DatabaseType::Mysql
        }

        async fn ensure_schema(&self) -> Result<(), DatabaseError> {
            Ok(())
        }

        async fn insert_batch(&self, users: Vec<User>) -> Result<usize, DatabaseError> {
            let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
            self.record(&names).await?;
            Ok(users.len())
        }

        async fn find_by_usernames(
            &self,
            usernames: Vec<String>,
        ) -> Result<Vec<User>, DatabaseError> {
            let names: Vec<&str> = usernames.iter().map(String::as_str).collect();
            self.record(&names).await?;
            Ok(usernames
                .iter()
                .filter(|name| !name.starts_with("ghost"))
                .map(|name| User::new(name.as_str(), format!("{}@example.com", name), 30, "Paris"))
                .collect())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct PlainFactory;

    #[async_trait]
    impl ConnectionFactory for PlainFactory {
        type Connection = ();

        fn database_type(&self) -> DatabaseType {
            DatabaseType::Postgresql
        }

        async fn create(&self) -> Result<(), DatabaseError> {
            Ok(())
        }

        async fn is_valid(&self, _conn: &mut ()) -> bool {
            true
        }

        async fn close(&self, _conn: ()) {}
    }

    /// Store whose inserts hold a pooled connection for `hold`
    struct PooledStore {
        pool: Arc<ConnectionPool<PlainFactory>>,
        hold: Duration,
    }

    #[async_trait]
    impl UserStore for PooledStore {
        fn database_type(&self) -> DatabaseType {
            DatabaseType::Postgresql
        }

        async fn ensure_schema(&self) -> Result<(), DatabaseError> {
            Ok(())
        }

        async fn insert_batch(&self, users: Vec<User>) -> Result<usize, DatabaseError> {
            let hold = self.hold;
            self.pool
                .with_connection(move |_conn| {
                    async move {
                        tokio::time::sleep(hold).await;
                        Ok(users.len())
                    }
                    .boxed()
                })
                .await
        }

        async fn find_by_usernames(
            &self,
            _usernames: Vec<String>,
        ) -> Result<Vec<User>, DatabaseError> {
            Ok(Vec::new())
        }

        async fn close(&self) {
            self.pool.close().await;
        }
    }

    fn users(count: usize) -> Vec<User> {
        (0..count)
            .map(|i| {
                User::new(
                    format!("user_{}", i),
                    format!("user_{}@example.com", i),
                    20 + (i % 60) as i32,
                    "DemoCity",
                )
            })
            .collect()
    }

    fn service() -> ConcurrentDatabaseService {
        ConcurrentDatabaseService::new(Arc::new(WorkerPool::new(WorkerPoolConfig {
            core_workers: 2,
            max_workers: 4,
            queue_capacity: 16,
            shutdown_timeout: Duration::from_millis(200),
        })))
    }

    #[rstest]
    #[case(10, 3, vec![0..3, 3..6, 6..10])]
    #[case(2, 5, vec![0..1, 1..2])]
    #[case(5, 0, vec![0..5])]
    #[case(0, 4, vec![])]
    #[case(4, 4, vec![0..1, 1..2, 2..3, 3..4])]
    #[case(100, 1, vec![0..100])]
    fn test_plan_shards(
        #[case] len: usize,
        #[case] threads: usize,
        #[case] expected: Vec<Range<usize>>,
    ) {
        assert_eq!(plan_shards(len, threads), expected);
    }

    #[test]
    fn test_split_into_follows_shards() {
        let chunks = split_into((0..7).collect::<Vec<_>>(), &plan_shards(7, 3));
        assert_eq!(chunks, vec![vec![0, 1], vec![2, 3], vec![4, 5, 6]]);
    }

    #[tokio::test]
    async fn test_insert_sums_all_shards() {
        let store = Arc::new(MockStore::default());
        let service = service().with_mysql(store.clone());

        let inserted = service.concurrent_mysql_insert(users(10), 3).await.unwrap();

        assert_eq!(inserted, 10);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        let mut sizes = store.shard_sizes.lock().clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![3, 3, 4]);
    }

    #[tokio::test]
    async fn test_failed_shard_contributes_nothing() {
        let store = Arc::new(MockStore::failing_on("user_0"));
        let service = service().with_postgres(store.clone());

        let inserted = service.concurrent_postgres_insert(users(9), 3).await.unwrap();

        assert_eq!(inserted, 6);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_threads_runs_single_shard() {
        let store = Arc::new(MockStore::default());
        let service = service().with_mongo(store.clone());

        assert_eq!(service.concurrent_mongo_insert(users(5), 0).await.unwrap(), 5);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_store() {
        let store = Arc::new(MockStore::default());
        let service = service().with_mysql(store.clone());

        assert_eq!(service.concurrent_mysql_insert(Vec::new(), 4).await.unwrap(), 0);
        assert!(service.concurrent_mysql_query(&[], 4).await.unwrap().is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_query_merges_shards() {
        let store = Arc::new(MockStore::default());
        let service = service().with_postgres(store.clone());
        let names: Vec<String> = vec!["alice", "ghost_1", "bob", "carol", "ghost_2"]
            .into_iter()
            .map(String::from)
            .collect();

        let found = service.concurrent_postgres_query(names, 2).await.unwrap();

        let mut found: Vec<String> = found.into_iter().map(|u| u.username).collect();
        found.sort();
        assert_eq!(found, vec!["alice", "bob", "carol"]);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mysql_query_uses_usernames() {
        let store = Arc::new(MockStore::default());
        let service = service().with_mysql(store.clone());

        let found = service.concurrent_mysql_query(&users(4), 2).await.unwrap();

        assert_eq!(found.len(), 4);
        assert!(found.iter().all(|u| u.username.starts_with("user_")));
    }

    #[tokio::test]
    async fn test_missing_store_is_not_configured() {
        let service = service();
        assert!(matches!(
            service.concurrent_mysql_insert(users(1), 1).await,
            Err(DatabaseError::NotConfigured(DatabaseType::Mysql))
        ));
        assert!(matches!(
            service.concurrent_mongo_query(vec!["a".to_string()], 1).await,
            Err(DatabaseError::NotConfigured(DatabaseType::Mongodb))
        ));
        assert!(matches!(
            service.store(DatabaseType::Neo4j),
            Err(DatabaseError::NotConfigured(DatabaseType::Neo4j))
        ));
    }

    #[tokio::test]
    async fn test_batch_timeout() {
        let store = Arc::new(MockStore::slow(Duration::from_secs(5)));
        let service = service()
            .with_mysql(store)
            .with_batch_timeout(Duration::from_millis(50));

        assert!(matches!(
            service.concurrent_mysql_insert(users(4), 2).await,
            Err(DatabaseError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_saturated_pool_skips_unscheduled_shards() {
        let service = ConcurrentDatabaseService::new(Arc::new(WorkerPool::new(WorkerPoolConfig {
            core_workers: 1,
            max_workers: 1,
            queue_capacity: 1,
            shutdown_timeout: Duration::from_millis(200),
        })));
        let store = Arc::new(MockStore::default());
        let service = service.with_mysql(store.clone());

        // Capacity is two tasks, so only two of the four shards run
        let inserted = service.concurrent_mysql_insert(users(8), 4).await.unwrap();

        assert_eq!(inserted, 4);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_batches() {
        let store = Arc::new(MockStore::default());
        let service = service().with_mysql(store.clone());

        service.shutdown().await;

        assert!(store.closed.load(Ordering::SeqCst));
        assert!(matches!(
            service.concurrent_mysql_insert(users(3), 2).await,
            Err(DatabaseError::WorkerPoolShutdown)
        ));
        assert!(matches!(
            service.concurrent_mysql_query(&users(3), 2).await,
            Err(DatabaseError::WorkerPoolShutdown)
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_frees_connections_of_running_shards() {
        let pool = Arc::new(ConnectionPool::new(
            PlainFactory,
            PoolConfig::default().with_max_size(4),
        ));
        let store = Arc::new(PooledStore {
            pool: Arc::clone(&pool),
            hold: Duration::from_secs(30),
        });
        let service = Arc::new(
            ConcurrentDatabaseService::new(Arc::new(WorkerPool::new(WorkerPoolConfig {
                core_workers: 1,
                max_workers: 4,
                queue_capacity: 4,
                shutdown_timeout: Duration::from_millis(50),
            })))
            .with_postgres(store),
        );

        let running = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.concurrent_postgres_insert(users(4), 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.active(), 2);

        service.shutdown().await;

        assert!(pool.is_shutdown());
        assert_eq!(pool.stats(), PoolStats { active: 0, total: 0, available: 0 });
        // Cancelled shards contribute nothing
        assert_eq!(running.await.unwrap().unwrap(), 0);
    }
}
