//! The seam between the coordination core and a vendor-specific driver.
//!
//! A driver supplies a [`SessionFactory`] that opens [`NativeSession`]s. Everything the
//! pool and transaction manager need from a live database session goes through this trait,
//! so tests swap in a session with injected faults at construction time instead of patching
//! behaviour at runtime.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::results::ResultSet;
use crate::types::RowValues;

/// Optional behaviour a driver may support. Probed once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Server-side prepared statements that should be cached per connection.
    pub statement_cache: bool,
    pub savepoints: bool,
    pub transaction_isolation: bool,
    pub explain: bool,
}

impl Capabilities {
    /// Every optional feature enabled.
    #[must_use]
    pub fn all() -> Self {
        Self {
            statement_cache: true,
            savepoints: true,
            transaction_isolation: true,
            explain: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Opaque handle to a statement prepared on one native session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreparedHandle {
    id: u64,
    name: Arc<str>,
    sql: Arc<str>,
}

impl PreparedHandle {
    #[must_use]
    pub fn new(id: u64, name: impl Into<Arc<str>>, sql: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            name: name.into(),
            sql: sql.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Driver-side statement name (e.g. the name passed to `DEALLOCATE`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Failure reported by a native session.
#[derive(Debug)]
pub struct NativeError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a driver error, keeping it reachable through [`std::error::Error::source`].
    pub fn from_source<E>(source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for NativeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|err| err.as_ref() as &(dyn StdError + 'static))
    }
}

/// A single live database session supplied by a driver.
///
/// Transaction and savepoint primitives default to plain SQL issued through
/// [`NativeSession::execute`]; drivers override them when the wire protocol has dedicated
/// calls.
#[async_trait]
pub trait NativeSession: Send {
    fn capabilities(&self) -> Capabilities;

    /// Liveness probe used at checkout. Must not fail; a broken session reports `false`.
    async fn is_alive(&mut self) -> bool;

    async fn execute(&mut self, sql: &str, binds: &[RowValues]) -> Result<ResultSet, NativeError>;

    async fn begin(&mut self) -> Result<(), NativeError> {
        self.execute("BEGIN", &[]).await.map(drop)
    }

    async fn begin_isolated(&mut self, level: IsolationLevel) -> Result<(), NativeError> {
        Err(NativeError::new(format!(
            "isolation level {level} is not supported by this adapter"
        )))
    }

    async fn commit(&mut self) -> Result<(), NativeError> {
        self.execute("COMMIT", &[]).await.map(drop)
    }

    async fn rollback(&mut self) -> Result<(), NativeError> {
        self.execute("ROLLBACK", &[]).await.map(drop)
    }

    async fn create_savepoint(&mut self, name: &str) -> Result<(), NativeError> {
        self.execute(&format!("SAVEPOINT {name}"), &[]).await.map(drop)
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), NativeError> {
        self.execute(&format!("RELEASE SAVEPOINT {name}"), &[])
            .await
            .map(drop)
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), NativeError> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .await
            .map(drop)
    }

    async fn prepare(&mut self, sql: &str) -> Result<PreparedHandle, NativeError> {
        Err(NativeError::new(format!(
            "prepared statements are not supported by this adapter ({sql})"
        )))
    }

    async fn execute_prepared(
        &mut self,
        handle: &PreparedHandle,
        binds: &[RowValues],
    ) -> Result<ResultSet, NativeError> {
        self.execute(handle.sql(), binds).await
    }

    async fn deallocate(&mut self, _handle: &PreparedHandle) -> Result<(), NativeError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), NativeError>;
}

/// Opens native sessions for a pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    fn adapter_name(&self) -> &'static str;

    async fn connect(&self) -> Result<Box<dyn NativeSession>, NativeError>;
}
