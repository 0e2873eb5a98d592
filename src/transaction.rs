//! Nested transactions on a single connection.
//!
//! Depth 0 is a real database transaction; every deeper frame is a savepoint. Records that
//! take part register as participants and are told the outcome exactly once.

mod frame;
mod manager;
mod options;

pub use frame::{TransactionFrame, savepoint_name};
pub use manager::{TransactionManager, TransactionScope};
pub use options::TransactionOptions;
