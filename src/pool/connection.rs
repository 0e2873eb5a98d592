use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::PoolShared;
use crate::connection::Connection;

/// A leased [`Connection`]. Dropping it checks the connection back in.
pub struct PooledConnection {
    conn: Option<Box<Connection>>,
    shared: Arc<PoolShared>,
    generation: u64,
}

impl PooledConnection {
    pub(super) fn new(conn: Box<Connection>, shared: Arc<PoolShared>, generation: u64) -> Self {
        Self {
            conn: Some(conn),
            shared,
            generation,
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        self.conn
            .as_deref()
            .expect("pooled connection is present until dropped")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
            .as_deref_mut()
            .expect("pooled connection is present until dropped")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.checkin(conn, self.generation);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("generation", &self.generation)
            .finish()
    }
}
