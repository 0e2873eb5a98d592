//! Bounded pool of [`Connection`]s shared by concurrent tasks.
//!
//! The state lock is a plain `std::sync::Mutex` and is never held across an `.await`.
//! Callers that find the pool exhausted park on a FIFO queue of oneshot channels; a checkin
//! hands its connection (or a freed slot) straight to the oldest waiter still listening.

mod connection;
mod types;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::adapter::SessionFactory;
use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::SqlCoordinatorError;
use crate::statement_cache::{PidSource, current_process_id};

pub use connection::PooledConnection;
pub use types::PoolStats;

/// What a parked caller receives: a ready connection, or permission to open one.
enum Grant {
    Handle(Box<Connection>),
    Slot,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Box<Connection>>,
    /// Live connections plus slots reserved for connections being opened.
    size: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    /// Bumped by `disconnect_all`; connections leased under an older generation are closed
    /// at checkin.
    generation: u64,
}

impl PoolState {
    /// Give `grant` to the oldest live waiter, or hand it back when nobody is waiting.
    fn hand_off(&mut self, mut grant: Grant) -> Option<Grant> {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            match waiter.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    pid: PidSource,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Free one slot, passing it to a waiter if there is one.
    fn release_slot(&self) {
        let mut state = self.lock();
        if state.hand_off(Grant::Slot).is_some() {
            state.size = state.size.saturating_sub(1);
        }
    }

    fn release_grant(&self, grant: Grant) {
        match grant {
            Grant::Handle(mut conn) => {
                conn.release();
                self.return_idle(conn);
            }
            Grant::Slot => self.release_slot(),
        }
    }

    fn return_idle(&self, conn: Box<Connection>) {
        let mut state = self.lock();
        if let Some(Grant::Handle(conn)) = state.hand_off(Grant::Handle(conn)) {
            state.idle.push_back(conn);
        }
    }

    /// Return a leased connection. Dead, stale, or mid-transaction connections are closed
    /// and their slot freed instead.
    pub(crate) fn checkin(&self, mut conn: Box<Connection>, generation: u64) {
        let stale = self.lock().generation != generation;
        let open_frames = conn.open_transactions();

        if conn.is_dead() || stale || open_frames > 0 {
            if open_frames > 0 {
                warn!(
                    conn_id = conn.id(),
                    depth = open_frames,
                    "discarding connection checked in with open transactions"
                );
                conn.abandon_transactions();
            } else if conn.is_dead() {
                warn!(conn_id = conn.id(), "discarding dead connection at checkin");
            } else {
                debug!(conn_id = conn.id(), "closing connection leased before disconnect_all");
            }
            close_in_background(conn);
            self.release_slot();
            return;
        }

        debug!(conn_id = conn.id(), "checked in connection");
        conn.release();
        self.return_idle(conn);
    }
}

fn close_in_background(mut conn: Box<Connection>) {
    if conn.is_dead() {
        return;
    }
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = conn.disconnect().await {
                debug!(conn_id = conn.id(), error = %e, "background disconnect failed");
            }
        });
    }
}

/// Parked checkout. Anything granted after the caller stopped waiting is handed back.
struct Waiter {
    rx: oneshot::Receiver<Grant>,
    shared: Arc<PoolShared>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(grant) = self.rx.try_recv() {
            self.shared.release_grant(grant);
        }
        self.shared.lock().waiters.retain(|w| !w.is_closed());
    }
}

/// A reserved pool slot with no connection yet. Released if dropped unused.
struct SlotGuard {
    shared: Arc<PoolShared>,
    armed: bool,
}

impl SlotGuard {
    fn new(shared: Arc<PoolShared>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

/// Shared, cloneable pool handle.
///
/// ```rust
/// use std::sync::Arc;
/// use sql_coordinator::prelude::*;
/// use sql_coordinator::memory::MemoryFactory;
///
/// # tokio_test_block(async {
/// let config = PoolConfig::builder().max_size(2).build()?;
/// let pool = ConnectionPool::new(config, Arc::new(MemoryFactory::new()))?;
/// let conn = pool.checkout().await?;
/// assert_eq!(pool.stats().leased, 1);
/// drop(conn);
/// assert_eq!(pool.stats().idle, 1);
/// # Ok::<(), SqlCoordinatorError>(())
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool. Connections are opened lazily on checkout.
    ///
    /// # Errors
    /// Returns `ConfigError` for an invalid configuration.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, SqlCoordinatorError> {
        Self::with_pid_source(config, factory, current_process_id())
    }

    /// Like [`ConnectionPool::new`], observing the process id through `pid`.
    ///
    /// # Errors
    /// Returns `ConfigError` for an invalid configuration.
    pub fn with_pid_source(
        config: PoolConfig,
        factory: Arc<dyn SessionFactory>,
        pid: PidSource,
    ) -> Result<Self, SqlCoordinatorError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                factory,
                pid,
                next_id: AtomicU64::new(1),
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn adapter_name(&self) -> &'static str {
        self.shared.factory.adapter_name()
    }

    /// Lease a connection, waiting at most the configured checkout timeout.
    ///
    /// # Errors
    /// Returns `ConnectionTimeout` when no connection frees up in time, or
    /// `ConnectionError` when a new session cannot be opened.
    pub async fn checkout(&self) -> Result<PooledConnection, SqlCoordinatorError> {
        self.checkout_timeout(self.shared.config.checkout_timeout())
            .await
    }

    /// Lease a connection, waiting at most `timeout`.
    ///
    /// An idle connection that turns out to be dead, or that was opened by another process,
    /// is dropped and replaced by a fresh one in the same slot.
    ///
    /// # Errors
    /// Returns `ConnectionTimeout` when no connection frees up in time, or
    /// `ConnectionError` when a new session cannot be opened.
    pub async fn checkout_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection, SqlCoordinatorError> {
        let started = Instant::now();
        // `None` when the timeout reaches past what the clock can represent.
        let deadline = started.checked_add(timeout);

        let (grant, generation) = self.acquire(started, deadline).await?;
        let mut conn = match grant {
            Grant::Handle(conn) => {
                let slot = SlotGuard::new(Arc::clone(&self.shared));
                match self.usable(conn).await {
                    Some(conn) => {
                        slot.disarm();
                        conn
                    }
                    None => self.connect(slot).await?,
                }
            }
            Grant::Slot => self.connect(SlotGuard::new(Arc::clone(&self.shared))).await?,
        };

        conn.lease();
        debug!(
            conn_id = conn.id(),
            waited_ms = started.elapsed().as_millis() as u64,
            "checked out connection"
        );
        Ok(PooledConnection::new(
            conn,
            Arc::clone(&self.shared),
            generation,
        ))
    }

    async fn acquire(
        &self,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<(Grant, u64), SqlCoordinatorError> {
        let rx = {
            let mut state = self.shared.lock();
            let generation = state.generation;
            if let Some(conn) = state.idle.pop_back() {
                return Ok((Grant::Handle(conn), generation));
            }
            if state.size < self.shared.config.max_size() {
                state.size += 1;
                return Ok((Grant::Slot, generation));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut waiter = Waiter {
            rx,
            shared: Arc::clone(&self.shared),
        };
        let received = match deadline {
            Some(deadline) => timeout_at(deadline, &mut waiter.rx).await,
            None => Ok((&mut waiter.rx).await),
        };
        match received {
            Ok(Ok(grant)) => {
                let generation = self.shared.lock().generation;
                Ok((grant, generation))
            }
            Ok(Err(_)) => Err(SqlCoordinatorError::ConnectionError(
                "pool stopped handing out connections".into(),
            )),
            Err(_) => {
                let waited = started.elapsed();
                debug!(waited_ms = waited.as_millis() as u64, "checkout timed out");
                Err(SqlCoordinatorError::ConnectionTimeout {
                    waited,
                    pool_size: self.shared.config.max_size(),
                })
            }
        }
    }

    /// `None` when the idle connection must be replaced.
    async fn usable(&self, mut conn: Box<Connection>) -> Option<Box<Connection>> {
        let pid = (self.shared.pid)();
        if conn.created_pid() != pid {
            warn!(
                conn_id = conn.id(),
                created_pid = conn.created_pid(),
                pid,
                "discarding connection inherited from another process"
            );
            return None;
        }
        if self.shared.config.verify_on_checkout && !conn.verify().await {
            warn!(conn_id = conn.id(), "discarding dead connection at checkout");
            return None;
        }
        Some(conn)
    }

    async fn connect(&self, slot: SlotGuard) -> Result<Box<Connection>, SqlCoordinatorError> {
        let factory = &self.shared.factory;
        let session = factory.connect().await.map_err(|e| {
            SqlCoordinatorError::ConnectionError(format!(
                "{} connect failed: {e}",
                factory.adapter_name()
            ))
        })?;
        slot.disarm();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = id, adapter = factory.adapter_name(), "opened connection");
        Ok(Box::new(Connection::new(
            id,
            factory.adapter_name(),
            session,
            self.shared.config.statement_limit,
            Arc::clone(&self.shared.pid),
        )))
    }

    /// Return a connection early. Equivalent to dropping it.
    pub fn checkin(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Check out a connection for the duration of `body`. It is checked in on every exit
    /// path, including errors and cancellation.
    ///
    /// # Errors
    /// Returns the checkout error or the body's error.
    pub async fn with_connection<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T, E>>,
        E: From<SqlCoordinatorError>,
    {
        let mut conn = self.checkout().await?;
        body(&mut *conn).await
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            max_size: self.shared.config.max_size(),
            size: state.size,
            idle: state.idle.len(),
            leased: state.size - state.idle.len(),
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
        }
    }

    /// Whether the pool holds any live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.lock().size > 0
    }

    /// Close every idle connection now. Leased connections are closed when checked in.
    pub async fn disconnect_all(&self) {
        let idle: Vec<Box<Connection>> = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.idle.drain(..).collect()
        };
        for mut conn in idle {
            if let Err(e) = conn.disconnect().await {
                warn!(conn_id = conn.id(), error = %e, "disconnect failed");
            }
            self.shared.release_slot();
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("adapter", &self.adapter_name())
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::memory::{MemoryFactory, NativeOp};

    fn pool(size: usize, timeout: Duration) -> (ConnectionPool, MemoryFactory) {
        let factory = MemoryFactory::new();
        let config = PoolConfig::builder()
            .max_size(size)
            .checkout_timeout(timeout)
            .build()
            .unwrap();
        (
            ConnectionPool::new(config, Arc::new(factory.clone())).unwrap(),
            factory,
        )
    }

    #[tokio::test]
    async fn idle_connection_is_reused() {
        let (pool, factory) = pool(2, Duration::from_secs(1));
        let first = pool.checkout().await.unwrap().id();
        let second = pool.checkout().await.unwrap().id();
        assert_eq!(first, second);
        assert_eq!(factory.connections_opened(), 1);
        assert_eq!(
            pool.stats(),
            PoolStats {
                max_size: 2,
                size: 1,
                idle: 1,
                leased: 0,
                waiting: 0
            }
        );
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let (pool, _) = pool(1, Duration::from_millis(50));
        let _held = pool.checkout().await.unwrap();
        let err = pool.checkout().await.unwrap_err();
        match err {
            SqlCoordinatorError::ConnectionTimeout { waited, pool_size } => {
                assert!(waited >= Duration::from_millis(50));
                assert_eq!(pool_size, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn timed_out_waiters_leave_the_queue() {
        let (pool, _) = pool(1, Duration::from_millis(5));
        let _held = pool.checkout().await.unwrap();
        for _ in 0..8 {
            assert!(pool.checkout().await.is_err());
        }
        assert!(pool.shared.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_for_checkin() {
        let (pool, _) = pool(1, Duration::from_secs(1));
        let held = pool.checkout().await.unwrap();
        let id = held.id();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout_timeout(Duration::MAX).await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().waiting, 1);
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn saturated_config_timeout_still_waits() {
        let factory = MemoryFactory::new();
        let config = PoolConfig::from_json(r#"{ "pool": 1, "checkout_timeout": 1e20 }"#).unwrap();
        let pool = ConnectionPool::new(config, Arc::new(factory)).unwrap();
        let held = pool.checkout().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn checkin_wakes_a_waiter() {
        let (pool, _) = pool(1, Duration::from_secs(2));
        let held = pool.checkout().await.unwrap();
        let id = held.id();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().waiting, 1);
        pool.checkin(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn checkin_stops_explain_collection() {
        let (pool, _) = pool(1, Duration::from_secs(1));
        let conn = pool.checkout().await.unwrap();
        conn.collect_explain(true).unwrap();
        drop(conn);

        let mut conn = pool.checkout().await.unwrap();
        assert!(!conn.explain_collector().is_collecting());
        conn.select_all("SELECT 1", &[]).await.unwrap();
        assert!(conn.explain_collector().queries().is_empty());
    }

    #[tokio::test]
    async fn dead_idle_connection_is_replaced() {
        let (pool, factory) = pool(1, Duration::from_secs(1));
        let first = pool.checkout().await.unwrap().id();
        factory.faults().kill_all();
        let conn = pool.checkout().await.unwrap();
        assert_ne!(conn.id(), first);
        assert_eq!(pool.stats().size, 1);
    }

    #[tokio::test]
    async fn forked_connection_is_dropped_without_native_calls() {
        let factory = MemoryFactory::new();
        let pid = Arc::new(AtomicU32::new(100));
        let source = Arc::clone(&pid);
        let pool = ConnectionPool::with_pid_source(
            PoolConfig::default(),
            Arc::new(factory.clone()),
            Arc::new(move || source.load(Ordering::SeqCst)),
        )
        .unwrap();

        let first = pool.checkout().await.unwrap().id();
        pid.store(200, Ordering::SeqCst);
        let conn = pool.checkout().await.unwrap();
        assert_ne!(conn.id(), first);
        assert_eq!(conn.created_pid(), 200);
        assert_eq!(factory.log().ops_for(1), vec![NativeOp::Connect]);
    }

    #[tokio::test]
    async fn failed_connect_frees_the_slot() {
        let (pool, factory) = pool(1, Duration::from_millis(100));
        factory.faults().fail_next_connect();
        assert!(matches!(
            pool.checkout().await,
            Err(SqlCoordinatorError::ConnectionError(_))
        ));
        assert_eq!(pool.stats().size, 0);
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_checkout_does_not_leak() {
        let (pool, _) = pool(1, Duration::from_secs(5));
        let held = pool.checkout().await.unwrap();
        let cancelled = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancelled.abort();
        let _ = cancelled.await;
        drop(held);

        let stats = pool.stats();
        assert_eq!((stats.size, stats.idle, stats.waiting), (1, 1, 0));
    }

    #[tokio::test]
    async fn disconnect_all_closes_idle_and_later_checkins() {
        let (pool, factory) = pool(2, Duration::from_secs(1));
        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        drop(a);
        pool.disconnect_all().await;
        assert_eq!(pool.stats().size, 1);
        assert!(pool.is_connected());

        drop(b);
        assert_eq!(pool.stats().size, 0);
        assert!(!pool.is_connected());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(factory.log().count(|op| *op == NativeOp::Disconnect), 2);
    }
}
