use std::fmt;

use async_trait::async_trait;

use super::config::SharedSqliteConnection;
use super::params::Params;
use super::query::build_result_set;
use crate::adapter::{Capabilities, NativeError, NativeSession, PreparedHandle};
use crate::results::ResultSet;
use crate::types::RowValues;

/// A single `rusqlite` connection driven from async code.
///
/// Every call runs on the blocking pool while holding the connection's mutex.
pub struct SqliteSession {
    conn: SharedSqliteConnection,
    next_prepared: u64,
}

impl SqliteSession {
    pub(crate) fn new(conn: SharedSqliteConnection) -> Self {
        Self {
            conn,
            next_prepared: 1,
        }
    }
}

impl fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteSession")
            .field("next_prepared", &self.next_prepared)
            .finish_non_exhaustive()
    }
}

pub(crate) async fn run_blocking<F, R>(conn: SharedSqliteConnection, func: F) -> Result<R, NativeError>
where
    F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.blocking_lock();
        let Some(conn) = guard.as_mut() else {
            return Err(NativeError::new("sqlite connection is closed"));
        };
        func(conn).map_err(NativeError::from_source)
    })
    .await
    .map_err(|e| NativeError::new(format!("sqlite spawn_blocking join error: {e}")))?
}

#[async_trait]
impl NativeSession for SqliteSession {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            statement_cache: true,
            savepoints: true,
            transaction_isolation: false,
            explain: true,
        }
    }

    async fn is_alive(&mut self) -> bool {
        run_blocking(self.conn.clone(), |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        })
        .await
        .is_ok()
    }

    async fn execute(&mut self, sql: &str, binds: &[RowValues]) -> Result<ResultSet, NativeError> {
        let sql = sql.to_owned();
        let params = Params::convert(binds);
        run_blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            build_result_set(&mut stmt, params.as_values())
        })
        .await
    }

    /// Warms rusqlite's statement cache; the handle names the cached SQL.
    async fn prepare(&mut self, sql: &str) -> Result<PreparedHandle, NativeError> {
        let owned = sql.to_owned();
        run_blocking(self.conn.clone(), move |conn| {
            conn.prepare_cached(&owned).map(drop)
        })
        .await?;
        let id = self.next_prepared;
        self.next_prepared += 1;
        Ok(PreparedHandle::new(id, format!("s{id}"), sql))
    }

    async fn execute_prepared(
        &mut self,
        handle: &PreparedHandle,
        binds: &[RowValues],
    ) -> Result<ResultSet, NativeError> {
        let sql = handle.sql().to_owned();
        let params = Params::convert(binds);
        run_blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            build_result_set(&mut stmt, params.as_values())
        })
        .await
    }

    /// rusqlite cannot drop a single cached statement, so this flushes the whole cache.
    async fn deallocate(&mut self, _handle: &PreparedHandle) -> Result<(), NativeError> {
        run_blocking(self.conn.clone(), |conn| {
            conn.flush_prepared_statement_cache();
            Ok(())
        })
        .await
    }

    async fn disconnect(&mut self) -> Result<(), NativeError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            match guard.take() {
                Some(conn) => conn.close().map_err(|(_, e)| NativeError::from_source(e)),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| NativeError::new(format!("sqlite spawn_blocking join error: {e}")))?
    }
}
