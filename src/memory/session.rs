use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::faults::FaultPlan;
use crate::adapter::{Capabilities, IsolationLevel, NativeError, NativeSession, PreparedHandle};
use crate::results::ResultSet;
use crate::types::RowValues;

/// A native call as seen by the memory driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeOp {
    Connect,
    Begin,
    BeginIsolated(IsolationLevel),
    Commit,
    Rollback,
    CreateSavepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
    Execute(String),
    Prepare(String),
    /// Carries the prepared statement's name.
    ExecutePrepared(String),
    Deallocate(String),
    Disconnect,
}

/// Ordered record of `(session id, op)` pairs.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: Arc<Mutex<Vec<(u64, NativeOp)>>>,
}

impl OperationLog {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, NativeOp)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, session: u64, op: NativeOp) {
        self.lock().push((session, op));
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(u64, NativeOp)> {
        self.lock().clone()
    }

    /// Ops from every session, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<NativeOp> {
        self.lock().iter().map(|(_, op)| op.clone()).collect()
    }

    #[must_use]
    pub fn ops_for(&self, session: u64) -> Vec<NativeOp> {
        self.lock()
            .iter()
            .filter(|(id, _)| *id == session)
            .map(|(_, op)| op.clone())
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&NativeOp) -> bool) -> usize {
        self.lock().iter().filter(|(_, op)| predicate(op)).count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[derive(Debug)]
pub struct MemorySession {
    id: u64,
    epoch: u64,
    capabilities: Capabilities,
    log: OperationLog,
    faults: FaultPlan,
    executed: i64,
    next_prepared: u64,
    closed: bool,
}

impl MemorySession {
    pub(crate) fn new(
        id: u64,
        capabilities: Capabilities,
        log: OperationLog,
        faults: FaultPlan,
    ) -> Self {
        let epoch = faults.epoch();
        Self {
            id,
            epoch,
            capabilities,
            log,
            faults,
            executed: 0,
            next_prepared: 1,
            closed: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn is_dead(&self) -> bool {
        self.closed || self.faults.epoch() != self.epoch
    }

    /// Record `op`, wait out any configured latency, then fail if the session is gone.
    async fn enter(&self, op: NativeOp) -> Result<(), NativeError> {
        self.log.push(self.id, op);
        self.faults.pause().await;
        if self.is_dead() {
            return Err(NativeError::new(format!(
                "memory: session {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn counter_row(&mut self) -> ResultSet {
        self.executed += 1;
        let mut rs = ResultSet::with_capacity(1);
        rs.set_column_names(Arc::new(vec!["n".to_string()]));
        rs.add_row_values(vec![RowValues::Int(self.executed)]);
        rs
    }
}

#[async_trait]
impl NativeSession for MemorySession {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn is_alive(&mut self) -> bool {
        !self.is_dead()
    }

    async fn execute(&mut self, sql: &str, _binds: &[RowValues]) -> Result<ResultSet, NativeError> {
        self.enter(NativeOp::Execute(sql.to_string())).await?;
        if self.faults.sql_fails(sql) {
            return Err(NativeError::new(format!("memory: injected failure for {sql}")));
        }
        Ok(self.counter_row())
    }

    async fn begin(&mut self) -> Result<(), NativeError> {
        self.enter(NativeOp::Begin).await
    }

    async fn begin_isolated(&mut self, level: IsolationLevel) -> Result<(), NativeError> {
        self.enter(NativeOp::BeginIsolated(level)).await
    }

    async fn commit(&mut self) -> Result<(), NativeError> {
        self.enter(NativeOp::Commit).await?;
        if self.faults.take_commit_failure() {
            return Err(NativeError::new("memory: injected commit failure"));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), NativeError> {
        self.enter(NativeOp::Rollback).await
    }

    async fn create_savepoint(&mut self, name: &str) -> Result<(), NativeError> {
        self.enter(NativeOp::CreateSavepoint(name.to_string()))
            .await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), NativeError> {
        self.enter(NativeOp::ReleaseSavepoint(name.to_string()))
            .await?;
        if self.faults.take_release_failure() {
            return Err(NativeError::new(format!(
                "memory: injected failure releasing {name}"
            )));
        }
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), NativeError> {
        self.enter(NativeOp::RollbackToSavepoint(name.to_string()))
            .await
    }

    async fn prepare(&mut self, sql: &str) -> Result<PreparedHandle, NativeError> {
        self.enter(NativeOp::Prepare(sql.to_string())).await?;
        if self.faults.sql_fails(sql) {
            return Err(NativeError::new(format!("memory: injected failure for {sql}")));
        }
        let id = self.next_prepared;
        self.next_prepared += 1;
        Ok(PreparedHandle::new(id, format!("a{id}"), sql))
    }

    async fn execute_prepared(
        &mut self,
        handle: &PreparedHandle,
        _binds: &[RowValues],
    ) -> Result<ResultSet, NativeError> {
        self.enter(NativeOp::ExecutePrepared(handle.name().to_string()))
            .await?;
        if self.faults.sql_fails(handle.sql()) {
            return Err(NativeError::new(format!(
                "memory: injected failure for {}",
                handle.sql()
            )));
        }
        Ok(self.counter_row())
    }

    async fn deallocate(&mut self, handle: &PreparedHandle) -> Result<(), NativeError> {
        self.enter(NativeOp::Deallocate(handle.name().to_string()))
            .await?;
        if self.faults.deallocate_fails() {
            return Err(NativeError::new(format!(
                "memory: injected failure deallocating {}",
                handle.name()
            )));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), NativeError> {
        self.log.push(self.id, NativeOp::Disconnect);
        self.closed = true;
        Ok(())
    }
}
