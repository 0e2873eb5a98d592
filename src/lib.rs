//! Connection, transaction, and callback coordination for SQL clients.
//!
//! - a bounded [`ConnectionPool`] with fair, timed checkout
//! - nested transactions with savepoints and per-record commit/rollback callbacks
//! - a fork-aware prepared-statement cache and a scoped query cache
//!
//! Drivers plug in through [`adapter::SessionFactory`]. An in-process [`memory`] driver
//! ships for tests; the `sqlite` feature adds a `rusqlite`-backed one.

pub mod prelude;

pub mod adapter;
pub mod callbacks;
pub mod config;
pub mod connection;
pub mod error;
pub mod explain;
pub mod handler;
pub mod memory;
pub mod pool;
pub mod query_cache;
pub mod results;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod statement_cache;
pub mod transaction;
pub mod tx_outcome;
pub mod types;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use connection::{Connection, HandleState};
pub use error::SqlCoordinatorError;
pub use handler::ConnectionHandler;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use results::{CustomDbRow, ResultSet};
pub use tx_outcome::{CloseReport, FrameState, Outcome, TxControl};
pub use types::RowValues;
