use std::time::Duration;

use thiserror::Error;

use crate::adapter::NativeError;

#[derive(Debug, Error)]
pub enum SqlCoordinatorError {
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    /// No handle became available before the caller's checkout deadline.
    #[error(
        "could not obtain a database connection within {waited:?}; all {pool_size} pooled connections were in use"
    )]
    ConnectionTimeout { waited: Duration, pool_size: usize },

    #[error("Connection not established: {0}")]
    ConnectionNotEstablished(String),

    /// The native session rejected a statement. Never retried automatically.
    #[error("Statement invalid: {source} (sql: {sql})")]
    StatementInvalid {
        sql: String,
        #[source]
        source: NativeError,
    },

    #[error("Transaction isolation error: {0}")]
    TransactionIsolation(String),

    #[error("No transaction is open on this connection")]
    NoActiveTransaction,

    #[error("Invalid callback filter: {0}")]
    InvalidCallbackFilter(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Unimplemented feature: {0}")]
    Unimplemented(String),

    #[error("Other database error: {0}")]
    Other(String),
}

impl SqlCoordinatorError {
    pub(crate) fn statement_invalid(sql: impl Into<String>, source: NativeError) -> Self {
        SqlCoordinatorError::StatementInvalid {
            sql: sql.into(),
            source,
        }
    }

    /// Whether the caller may simply try the same operation again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SqlCoordinatorError::ConnectionTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = SqlCoordinatorError::ConnectionTimeout {
            waited: Duration::from_millis(500),
            pool_size: 1,
        };
        assert!(timeout.is_retryable());
        assert!(!SqlCoordinatorError::NoActiveTransaction.is_retryable());
        assert!(
            !SqlCoordinatorError::statement_invalid("SELECT 1", NativeError::new("boom"))
                .is_retryable()
        );
    }

    #[test]
    fn statement_invalid_keeps_native_source() {
        let err = SqlCoordinatorError::statement_invalid("COMMIT", NativeError::new("disk full"));
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("disk full"));
        assert!(err.to_string().contains("COMMIT"));
    }
}
