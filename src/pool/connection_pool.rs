// Generic bounded connection pool
// Lazily creates connections up to a maximum, validates them on checkout and
// return, and makes callers wait (with a timeout) once the pool is exhausted.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::db::traits::{ConnectionFactory, DatabaseError};

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live connections (idle + checked out)
    pub max_size: usize,
    /// How long `acquire` waits for a release once the pool is full
    pub acquire_timeout: Duration,
    /// Extra wait before giving up
    pub final_attempt_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 20,
            acquire_timeout: Duration::from_secs(30),
            final_attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_final_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.final_attempt_timeout = timeout;
        self
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub total: usize,
    pub available: usize,
}

/// One unit of the pool's `total` count. Dropping the guard gives the unit
/// back and wakes a waiter.
struct SlotGuard<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    held: bool,
}

impl<'a, F: ConnectionFactory> SlotGuard<'a, F> {
    /// Take over a unit that is already counted
    fn held(pool: &'a ConnectionPool<F>) -> Self {
        Self { pool, held: true }
    }

    /// The connection behind this slot now lives in the pool
    fn keep(mut self) {
        self.held = false;
    }
}

impl<F: ConnectionFactory> Drop for SlotGuard<'_, F> {
    fn drop(&mut self) {
        if self.held {
            self.pool.total.fetch_sub(1, Ordering::AcqRel);
            self.pool.released.notify_one();
        }
    }
}

const DETACHED: &str = "pooled connection used after detach";

/// A checked-out connection.
///
/// Hand it back with [`ConnectionPool::release`]. If it is dropped instead,
/// for example because the task holding it was cancelled, the connection is
/// dropped with it and its slot goes back to the pool.
pub struct PooledConnection<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    conn: Option<F::Connection>,
}

impl<'a, F: ConnectionFactory> PooledConnection<'a, F> {
    fn new(pool: &'a ConnectionPool<F>, conn: F::Connection) -> Self {
        pool.active.fetch_add(1, Ordering::AcqRel);
        Self {
            pool,
            conn: Some(conn),
        }
    }

    /// Stop counting the connection as checked out. The returned slot still
    /// counts it toward `total`.
    fn detach(mut self) -> (F::Connection, SlotGuard<'a, F>) {
        let conn = self.conn.take().expect(DETACHED);
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
        (conn, SlotGuard::held(self.pool))
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<'_, F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        self.conn.as_ref().expect(DETACHED)
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<'_, F> {
    fn deref_mut(&mut self) -> &mut F::Connection {
        self.conn.as_mut().expect(DETACHED)
    }
}

impl<F> fmt::Debug for PooledConnection<'_, F>
where
    F: ConnectionFactory,
    F::Connection: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<'_, F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            self.pool.active.fetch_sub(1, Ordering::AcqRel);
            self.pool.total.fetch_sub(1, Ordering::AcqRel);
            self.pool.released.notify_one();
            tracing::warn!(
                total = self.pool.total(),
                active = self.pool.active(),
                "Pooled connection dropped without release"
            );
        }
    }
}

/// What a waiter got when it woke up
enum Checkout<'a, F: ConnectionFactory> {
    Idle(F::Connection),
    Slot(SlotGuard<'a, F>),
}

/// Bounded pool of connections produced by a [`ConnectionFactory`]
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<F::Connection>>,
    released: Notify,
    active: AtomicUsize,
    total: AtomicUsize,
    shutdown: AtomicBool,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        tracing::info!(
            database = %factory.database_type(),
            max_size,
            "Connection pool initialized"
        );
        Self {
            factory,
            idle: Mutex::new(VecDeque::with_capacity(max_size)),
            config: PoolConfig { max_size, ..config },
            released: Notify::new(),
            active: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Check out a connection.
    ///
    /// Reuses a valid idle connection when there is one, otherwise creates a
    /// new one while the pool is below `max_size`. A full pool waits for a
    /// release for `acquire_timeout`, then once more for
    /// `final_attempt_timeout`, before failing with
    /// [`DatabaseError::PoolExhausted`].
    pub async fn acquire(&self) -> Result<PooledConnection<'_, F>, DatabaseError> {
        self.ensure_open()?;

        let popped = self.idle.lock().pop_front();
        if let Some(conn) = popped {
            if let Some(conn) = self.checkout_if_valid(conn).await {
                tracing::debug!(active = self.active(), "Retrieved connection from pool");
                return Ok(conn);
            }
        }

        if let Some(slot) = self.try_reserve_slot() {
            return self.create_reserved(slot).await;
        }

        let phases = [self.config.acquire_timeout, self.config.final_attempt_timeout];
        for (attempt, timeout) in phases.iter().enumerate() {
            match self.wait_for_checkout(*timeout).await? {
                Some(Checkout::Idle(conn)) => {
                    if let Some(conn) = self.checkout_if_valid(conn).await {
                        tracing::debug!(
                            attempt,
                            active = self.active(),
                            "Retrieved connection from pool after waiting"
                        );
                        return Ok(conn);
                    }
                    if let Some(slot) = self.try_reserve_slot() {
                        return self.create_reserved(slot).await;
                    }
                }
                Some(Checkout::Slot(slot)) => return self.create_reserved(slot).await,
                None => {}
            }
        }

        tracing::warn!(
            total = self.total(),
            active = self.active(),
            "Connection pool exhausted"
        );
        Err(DatabaseError::PoolExhausted {
            attempts: phases.len() + 1,
        })
    }

    /// Return a connection to the pool.
    ///
    /// Valid connections go back on the idle queue while there is room; any
    /// other connection is closed and its slot freed. After shutdown every
    /// returned connection is closed.
    pub async fn release(&self, mut conn: PooledConnection<'_, F>) {
        debug_assert!(
            std::ptr::eq(conn.pool, self),
            "connection released to a pool that did not create it"
        );
        let valid = !self.is_shutdown() && self.factory.is_valid(&mut *conn).await;
        let (conn, slot) = conn.detach();

        let rejected = {
            let mut idle = self.idle.lock();
            // `close` sets the flag before draining, so checking it under the
            // lock keeps connections out of a drained queue
            if valid && !self.is_shutdown() && idle.len() < self.config.max_size {
                idle.push_back(conn);
                slot.keep();
                None
            } else {
                Some((conn, slot))
            }
        };

        match rejected {
            None => {
                self.released.notify_one();
                tracing::debug!(active = self.active(), "Returned connection to pool");
            }
            Some((conn, slot)) => {
                self.factory.close(conn).await;
                drop(slot);
                tracing::debug!(
                    valid,
                    total = self.total(),
                    active = self.active(),
                    "Closed connection on release"
                );
            }
        }
    }

    /// Run `op` on a pooled connection. The connection is released whether or
    /// not `op` succeeds, and dropping the returned future frees its slot.
    pub async fn with_connection<R, Op>(&self, op: Op) -> Result<R, DatabaseError>
    where
        Op: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, Result<R, DatabaseError>>,
    {
        let mut conn = self.acquire().await?;
        let result = op(&mut *conn).await;
        self.release(conn).await;
        result
    }

    /// Shut the pool down and close every idle connection.
    ///
    /// Checked-out connections are closed when they are released.
    pub async fn close(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(database = %self.factory.database_type(), "Shutting down connection pool");

        let drained: Vec<(F::Connection, SlotGuard<'_, F>)> = self
            .idle
            .lock()
            .drain(..)
            .map(|conn| (conn, SlotGuard::held(self)))
            .collect();
        for (conn, slot) in drained {
            self.factory.close(conn).await;
            drop(slot);
        }
        self.released.notify_waiters();

        tracing::info!(
            database = %self.factory.database_type(),
            total = self.total(),
            "Connection pool shutdown completed"
        );
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.active(),
            total: self.total(),
            available: self.available(),
        }
    }

    fn ensure_open(&self) -> Result<(), DatabaseError> {
        if self.is_shutdown() {
            Err(DatabaseError::PoolShutdown)
        } else {
            Ok(())
        }
    }

    /// Validate an idle connection; invalid ones are closed and dropped from
    /// the total.
    async fn checkout_if_valid(&self, conn: F::Connection) -> Option<PooledConnection<'_, F>> {
        let mut pooled = PooledConnection::new(self, conn);
        if self.factory.is_valid(&mut *pooled).await {
            return Some(pooled);
        }

        let (conn, slot) = pooled.detach();
        self.factory.close(conn).await;
        drop(slot);
        tracing::warn!(total = self.total(), "Removed invalid connection from pool");
        None
    }

    /// Claim room for one more connection. Keeps `total <= max_size`.
    fn try_reserve_slot(&self) -> Option<SlotGuard<'_, F>> {
        let max_size = self.config.max_size;
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                (total < max_size).then_some(total + 1)
            })
            .ok()
            .map(|_| SlotGuard::held(self))
    }

    async fn create_reserved<'a>(
        &'a self,
        slot: SlotGuard<'a, F>,
    ) -> Result<PooledConnection<'a, F>, DatabaseError> {
        let conn = self.factory.create().await?;
        slot.keep();
        let conn = PooledConnection::new(self, conn);
        tracing::debug!(
            total = self.total(),
            active = self.active(),
            "Created new connection"
        );
        Ok(conn)
    }

    /// Wait until a connection is released or a slot frees up.
    async fn wait_for_checkout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Checkout<'_, F>>, DatabaseError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a release between the
            // check and the await is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            let popped = self.idle.lock().pop_front();
            if let Some(conn) = popped {
                return Ok(Some(Checkout::Idle(conn)));
            }
            if let Some(slot) = self.try_reserve_slot() {
                return Ok(Some(Checkout::Slot(slot)));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}
