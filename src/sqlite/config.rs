use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::session::SqliteSession;
use crate::adapter::{NativeError, NativeSession, SessionFactory};
use crate::config::PoolConfig;
use crate::error::SqlCoordinatorError;
use crate::pool::ConnectionPool;

pub(crate) type SharedSqliteConnection = Arc<Mutex<Option<rusqlite::Connection>>>;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for opening `SQLite` sessions.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub db_path: String,
    /// Switch the database to WAL journaling on every new session.
    pub wal: bool,
    pub busy_timeout: Duration,
}

impl SqliteOptions {
    #[must_use]
    pub fn new(db_path: String) -> Self {
        Self {
            db_path,
            wal: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }
}

/// Fluent builder for `SQLite` options.
#[derive(Debug, Clone)]
pub struct SqliteOptionsBuilder {
    opts: SqliteOptions,
}

impl SqliteOptionsBuilder {
    #[must_use]
    pub fn new(db_path: String) -> Self {
        Self {
            opts: SqliteOptions::new(db_path),
        }
    }

    #[must_use]
    pub fn wal(mut self, wal: bool) -> Self {
        self.opts.wal = wal;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.opts.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn finish(self) -> SqliteOptions {
        self.opts
    }

    /// Build a pool of `SQLite` connections and smoke-test one checkout.
    ///
    /// # Errors
    /// Returns `SqlCoordinatorError` if the pool config is invalid or the first connection
    /// cannot be opened.
    pub async fn build(self, config: PoolConfig) -> Result<ConnectionPool, SqlCoordinatorError> {
        let pool = ConnectionPool::new(config, Arc::new(SqliteFactory::new(self.finish())))?;
        drop(pool.checkout().await?);
        Ok(pool)
    }
}

/// Opens one `rusqlite` connection per pooled handle.
#[derive(Debug, Clone)]
pub struct SqliteFactory {
    opts: SqliteOptions,
}

impl SqliteFactory {
    #[must_use]
    pub fn new(opts: SqliteOptions) -> Self {
        Self { opts }
    }

    #[must_use]
    pub fn builder(db_path: String) -> SqliteOptionsBuilder {
        SqliteOptionsBuilder::new(db_path)
    }

    #[must_use]
    pub fn options(&self) -> &SqliteOptions {
        &self.opts
    }
}

fn open(opts: &SqliteOptions) -> rusqlite::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(Path::new(&opts.db_path))?;
    conn.busy_timeout(opts.busy_timeout)?;
    if opts.wal {
        // journal_mode returns a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
    }
    Ok(conn)
}

#[async_trait]
impl SessionFactory for SqliteFactory {
    fn adapter_name(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&self) -> Result<Box<dyn NativeSession>, NativeError> {
        let opts = self.opts.clone();
        let conn = tokio::task::spawn_blocking(move || open(&opts))
            .await
            .map_err(|e| NativeError::new(format!("sqlite spawn_blocking join error: {e}")))?
            .map_err(NativeError::from_source)?;
        Ok(Box::new(SqliteSession::new(Arc::new(Mutex::new(Some(
            conn,
        ))))))
    }
}
