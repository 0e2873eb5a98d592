//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and functions
//! to make it easier to get started with the library.

pub use crate::adapter::{Capabilities, IsolationLevel, NativeSession, SessionFactory};
pub use crate::callbacks::{ActionKind, Notification, ParticipantId, TransactionCallbacks};
pub use crate::config::PoolConfig;
pub use crate::connection::Connection;
pub use crate::error::SqlCoordinatorError;
pub use crate::explain::{CollectedQuery, ExplainCollector};
pub use crate::handler::ConnectionHandler;
pub use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
pub use crate::query_cache::{QueryCache, QueryCacheScope};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::transaction::{TransactionOptions, TransactionScope};
pub use crate::tx_outcome::{CloseReport, FrameState, Outcome, TxControl};
pub use crate::types::RowValues;

#[cfg(feature = "sqlite")]
pub use crate::sqlite::{SqliteFactory, SqliteOptions, SqliteOptionsBuilder};
