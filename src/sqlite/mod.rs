// SQLite driver for the coordination core.
//
// - config: options, builder and the session factory
// - params: bind conversion from `RowValues`
// - query: result extraction
// - session: the `NativeSession` implementation

mod config;
mod params;
mod query;
mod session;

pub use config::{SqliteFactory, SqliteOptions, SqliteOptionsBuilder};
pub use params::{Params, row_value_to_sqlite_value};
pub use query::build_result_set;
pub use session::SqliteSession;
