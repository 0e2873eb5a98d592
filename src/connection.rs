//! A single live database session and the per-session state layered on top of it.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::adapter::{Capabilities, NativeError, NativeSession, PreparedHandle};
use crate::callbacks::{ActionKind, DispatchReport, ParticipantId, TransactionCallbacks};
use crate::error::SqlCoordinatorError;
use crate::explain::{self, CollectedQuery, ExplainCollector};
use crate::query_cache::{QueryCache, fingerprint};
use crate::results::ResultSet;
use crate::statement_cache::{PidSource, StatementCache};
use crate::transaction::{TransactionManager, TransactionOptions, TransactionScope};
use crate::tx_outcome::{CloseReport, Outcome, TxControl};
use crate::types::RowValues;

/// Where a connection is in its pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    Leased,
    Dead,
}

pub struct Connection {
    id: u64,
    state: HandleState,
    owner: Option<ThreadId>,
    created_pid: u32,
    created_at: Instant,
    adapter: &'static str,
    session: Box<dyn NativeSession>,
    capabilities: Capabilities,
    statements: StatementCache,
    transactions: TransactionManager,
    query_cache: QueryCache,
    explain: ExplainCollector,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        adapter: &'static str,
        session: Box<dyn NativeSession>,
        statement_limit: usize,
        pid: PidSource,
    ) -> Self {
        let capabilities = session.capabilities();
        let created_pid = pid();
        Self {
            id,
            state: HandleState::Idle,
            owner: None,
            created_pid,
            created_at: Instant::now(),
            adapter,
            session,
            capabilities,
            statements: StatementCache::new(statement_limit, pid),
            transactions: TransactionManager::new(),
            query_cache: QueryCache::new(),
            explain: ExplainCollector::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Thread that leased this connection, while it is leased.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    #[must_use]
    pub fn created_pid(&self) -> u32 {
        self.created_pid
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[must_use]
    pub fn adapter_name(&self) -> &'static str {
        self.adapter
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    #[must_use]
    pub fn query_cache(&self) -> &QueryCache {
        &self.query_cache
    }

    #[must_use]
    pub fn explain_collector(&self) -> &ExplainCollector {
        &self.explain
    }

    /// Switch EXPLAIN collection on or off for this connection.
    ///
    /// # Errors
    /// Returns `Unimplemented` when the driver cannot explain statements.
    pub fn collect_explain(&self, collecting: bool) -> Result<(), SqlCoordinatorError> {
        if !self.capabilities.explain {
            return Err(self.explain_unsupported());
        }
        self.explain.set_collecting(collecting);
        Ok(())
    }

    fn explain_unsupported(&self) -> SqlCoordinatorError {
        SqlCoordinatorError::Unimplemented(format!(
            "{} adapter does not support EXPLAIN",
            self.adapter
        ))
    }

    #[must_use]
    pub fn statement_cache(&self) -> &StatementCache {
        &self.statements
    }

    #[must_use]
    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.transactions.open_transactions()
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state == HandleState::Dead
    }

    pub(crate) fn lease(&mut self) {
        self.state = HandleState::Leased;
        self.owner = Some(thread::current().id());
    }

    pub(crate) fn release(&mut self) {
        self.state = HandleState::Idle;
        self.owner = None;
        self.explain.reset();
    }

    fn ensure_active(&self, sql: &str) -> Result<(), SqlCoordinatorError> {
        if self.is_dead() {
            return Err(SqlCoordinatorError::statement_invalid(
                sql,
                NativeError::new(format!("connection {} is closed", self.id)),
            ));
        }
        Ok(())
    }

    // Raw primitives. They bypass the frame stack; use `transaction` or
    // `begin_transaction`/`close` to get savepoints and callbacks.

    /// # Errors
    /// Returns `StatementInvalid` if the native call fails or the connection is closed.
    pub async fn begin(&mut self) -> Result<(), SqlCoordinatorError> {
        self.ensure_active("BEGIN")?;
        self.session
            .begin()
            .await
            .map_err(|e| SqlCoordinatorError::statement_invalid("BEGIN", e))
    }

    /// # Errors
    /// Returns `StatementInvalid` if the native call fails or the connection is closed.
    pub async fn commit(&mut self) -> Result<(), SqlCoordinatorError> {
        self.ensure_active("COMMIT")?;
        self.session
            .commit()
            .await
            .map_err(|e| SqlCoordinatorError::statement_invalid("COMMIT", e))
    }

    /// # Errors
    /// Returns `StatementInvalid` if the native call fails or the connection is closed.
    pub async fn rollback(&mut self) -> Result<(), SqlCoordinatorError> {
        self.ensure_active("ROLLBACK")?;
        self.session
            .rollback()
            .await
            .map_err(|e| SqlCoordinatorError::statement_invalid("ROLLBACK", e))
    }

    /// # Errors
    /// Returns `StatementInvalid` if the native call fails or the connection is closed.
    pub async fn create_savepoint(&mut self, name: &str) -> Result<(), SqlCoordinatorError> {
        let sql = format!("SAVEPOINT {name}");
        self.ensure_active(&sql)?;
        self.session
            .create_savepoint(name)
            .await
            .map_err(|e| SqlCoordinatorError::statement_invalid(sql, e))
    }

    /// # Errors
    /// Returns `StatementInvalid` if the native call fails or the connection is closed.
    pub async fn release_savepoint(&mut self, name: &str) -> Result<(), SqlCoordinatorError> {
        let sql = format!("RELEASE SAVEPOINT {name}");
        self.ensure_active(&sql)?;
        self.session
            .release_savepoint(name)
            .await
            .map_err(|e| SqlCoordinatorError::statement_invalid(sql, e))
    }

    /// # Errors
    /// Returns `StatementInvalid` if the native call fails or the connection is closed.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), SqlCoordinatorError> {
        let sql = format!("ROLLBACK TO SAVEPOINT {name}");
        self.ensure_active(&sql)?;
        self.session
            .rollback_to_savepoint(name)
            .await
            .map_err(|e| SqlCoordinatorError::statement_invalid(sql, e))
    }

    /// Run a write or DDL statement. Clears the query cache first when it is enabled.
    ///
    /// # Errors
    /// Returns `StatementInvalid` if the statement fails or the connection is closed.
    pub async fn execute(
        &mut self,
        sql: &str,
        binds: &[RowValues],
    ) -> Result<ResultSet, SqlCoordinatorError> {
        self.exec_query(explain::DEFAULT_NAME, sql, binds).await
    }

    /// [`Connection::execute`] under a statement name. Statements named `SCHEMA` or
    /// `EXPLAIN` are logged but never collected for EXPLAIN.
    ///
    /// # Errors
    /// Returns `StatementInvalid` if the statement fails or the connection is closed.
    pub async fn exec_query(
        &mut self,
        name: &str,
        sql: &str,
        binds: &[RowValues],
    ) -> Result<ResultSet, SqlCoordinatorError> {
        self.ensure_active(sql)?;
        if self.query_cache.is_enabled() {
            self.query_cache.clear();
        }
        self.run_statement(name, sql, binds).await
    }

    /// Run a read, served from the query cache when it is enabled.
    ///
    /// # Errors
    /// Returns `StatementInvalid` if the statement fails or the connection is closed.
    pub async fn select_all(
        &mut self,
        sql: &str,
        binds: &[RowValues],
    ) -> Result<Arc<ResultSet>, SqlCoordinatorError> {
        self.ensure_active(sql)?;
        if !self.query_cache.is_enabled() {
            return Ok(Arc::new(
                self.run_statement(explain::DEFAULT_NAME, sql, binds).await?,
            ));
        }
        let key = fingerprint(sql, binds);
        if let Some(hit) = self.query_cache.lookup(&key) {
            debug!(conn_id = self.id, "query cache hit");
            return Ok(hit);
        }
        let result = Arc::new(self.run_statement(explain::DEFAULT_NAME, sql, binds).await?);
        self.query_cache.store(key, Arc::clone(&result));
        Ok(result)
    }

    /// Query plan for `sql`, when the driver supports it.
    ///
    /// # Errors
    /// Returns `Unimplemented` without driver support, otherwise `StatementInvalid` on failure.
    pub async fn explain(&mut self, sql: &str) -> Result<ResultSet, SqlCoordinatorError> {
        self.explain_with(sql, &[]).await
    }

    /// Explain every collected statement with the binds it ran with, draining the collector.
    ///
    /// # Errors
    /// Returns `Unimplemented` without driver support, otherwise the first `StatementInvalid`.
    pub async fn explain_collected(
        &mut self,
    ) -> Result<Vec<(CollectedQuery, ResultSet)>, SqlCoordinatorError> {
        if !self.capabilities.explain {
            return Err(self.explain_unsupported());
        }
        let mut plans = Vec::new();
        for query in self.explain.take() {
            let plan = self.explain_with(&query.sql, &query.binds).await?;
            plans.push((query, plan));
        }
        Ok(plans)
    }

    async fn explain_with(
        &mut self,
        sql: &str,
        binds: &[RowValues],
    ) -> Result<ResultSet, SqlCoordinatorError> {
        if !self.capabilities.explain {
            return Err(self.explain_unsupported());
        }
        let explain = format!("EXPLAIN {sql}");
        self.ensure_active(&explain)?;
        let result = self.session.execute(&explain, binds).await;
        explain::instrument(
            self.id,
            Some(&self.explain),
            "EXPLAIN",
            &explain,
            binds,
            result.is_err(),
        );
        result.map_err(|e| SqlCoordinatorError::statement_invalid(explain, e))
    }

    async fn run_statement(
        &mut self,
        name: &str,
        sql: &str,
        binds: &[RowValues],
    ) -> Result<ResultSet, SqlCoordinatorError> {
        let result = self.dispatch_statement(sql, binds).await;
        explain::instrument(
            self.id,
            self.capabilities.explain.then_some(&self.explain),
            name,
            sql,
            binds,
            result.is_err(),
        );
        result
    }

    async fn dispatch_statement(
        &mut self,
        sql: &str,
        binds: &[RowValues],
    ) -> Result<ResultSet, SqlCoordinatorError> {
        if !self.capabilities.statement_cache || binds.is_empty() {
            return self
                .session
                .execute(sql, binds)
                .await
                .map_err(|e| SqlCoordinatorError::statement_invalid(sql, e));
        }

        let handle = match self.statements.fetch(sql) {
            Some(handle) => handle,
            None => {
                let handle = self
                    .session
                    .prepare(sql)
                    .await
                    .map_err(|e| SqlCoordinatorError::statement_invalid(sql, e))?;
                let evicted = self.statements.put(sql, handle.clone());
                self.deallocate_all(evicted).await;
                handle
            }
        };
        self.session
            .execute_prepared(&handle, binds)
            .await
            .map_err(|e| SqlCoordinatorError::statement_invalid(sql, e))
    }

    /// Failures are expected once the session is gone, so they are only logged.
    async fn deallocate_all(&mut self, handles: Vec<PreparedHandle>) {
        for handle in handles {
            if let Err(e) = self.session.deallocate(&handle).await {
                warn!(conn_id = self.id, statement = handle.name(), error = %e, "deallocate failed");
            }
        }
    }

    /// Drop every cached prepared statement.
    pub async fn clear_statement_cache(&mut self) {
        let handles = self.statements.clear();
        self.deallocate_all(handles).await;
    }

    /// # Errors
    /// See [`TransactionManager::begin_transaction`].
    pub async fn begin_transaction(
        &mut self,
        options: &TransactionOptions,
    ) -> Result<TransactionScope, SqlCoordinatorError> {
        self.ensure_active("BEGIN")?;
        self.transactions
            .begin_transaction(self.session.as_mut(), options)
            .await
    }

    /// # Errors
    /// Returns `NoActiveTransaction` when no frame is open.
    pub fn register_participant(
        &mut self,
        id: impl Into<ParticipantId>,
        action: ActionKind,
        callbacks: Arc<TransactionCallbacks>,
    ) -> Result<(), SqlCoordinatorError> {
        self.transactions.register_participant(id, action, callbacks)
    }

    /// # Errors
    /// See [`TransactionManager::close`].
    pub async fn close(
        &mut self,
        scope: TransactionScope,
        outcome: Outcome,
    ) -> Result<CloseReport, SqlCoordinatorError> {
        self.transactions
            .close(self.session.as_mut(), scope, outcome)
            .await
    }

    /// Run `body` inside a transaction frame.
    ///
    /// Returns `Some(value)` when the frame committed and `None` when the body asked for a
    /// rollback with [`TxControl::Rollback`]. A body error rolls the frame back and is
    /// returned as is.
    ///
    /// ```rust,no_run
    /// use sql_coordinator::prelude::*;
    ///
    /// # async fn demo(conn: &mut Connection) -> Result<(), SqlCoordinatorError> {
    /// let inserted = conn
    ///     .transaction(TransactionOptions::new(), |tx| {
    ///         Box::pin(async move {
    ///             let rs = tx.execute("INSERT INTO t VALUES (?)", &[RowValues::Int(1)]).await?;
    ///             Ok::<_, SqlCoordinatorError>(TxControl::Commit(rs.rows_affected))
    ///         })
    ///     })
    ///     .await?;
    /// assert!(inserted.is_some());
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// Returns the body's error, or the error from opening or closing the frame.
    pub async fn transaction<T, E, F>(
        &mut self,
        options: TransactionOptions,
        body: F,
    ) -> Result<Option<T>, E>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<TxControl<T>, E>>,
        E: From<SqlCoordinatorError>,
    {
        let scope = self.begin_transaction(&options).await?;
        match body(self).await {
            Ok(TxControl::Commit(value)) => {
                self.close(scope, Outcome::Commit).await?;
                Ok(Some(value))
            }
            Ok(TxControl::Rollback) => {
                self.close(scope, Outcome::Rollback).await?;
                Ok(None)
            }
            Err(e) => {
                if let Err(close_err) = self.close(scope, Outcome::Rollback).await {
                    warn!(conn_id = self.id, error = %close_err, "rollback after failed transaction body failed");
                }
                Err(e)
            }
        }
    }

    pub(crate) fn abandon_transactions(&mut self) -> DispatchReport {
        self.transactions.abandon()
    }

    /// Liveness probe. A failed probe marks the connection dead.
    pub async fn verify(&mut self) -> bool {
        if self.is_dead() {
            return false;
        }
        let alive = self.session.is_alive().await;
        if !alive {
            self.state = HandleState::Dead;
        }
        alive
    }

    /// Close the native session. Open frames are abandoned and their participants told the
    /// work was rolled back.
    ///
    /// # Errors
    /// Returns `ConnectionError` if the driver reports a failure; the connection is dead
    /// either way.
    pub async fn disconnect(&mut self) -> Result<(), SqlCoordinatorError> {
        if self.is_dead() {
            return Ok(());
        }
        self.clear_statement_cache().await;
        if self.transactions.is_open() {
            warn!(
                conn_id = self.id,
                depth = self.transactions.open_transactions(),
                "disconnecting with open transactions"
            );
            self.transactions.abandon();
        }
        self.state = HandleState::Dead;
        self.owner = None;
        self.session
            .disconnect()
            .await
            .map_err(|e| SqlCoordinatorError::ConnectionError(format!("disconnect failed: {e}")))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("adapter", &self.adapter)
            .field("state", &self.state)
            .field("owner", &self.owner)
            .field("created_pid", &self.created_pid)
            .field("open_transactions", &self.transactions.open_transactions())
            .field("statements", &self.statements.len())
            .finish_non_exhaustive()
    }
}
