use serde::Serialize;

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured maximum number of connections.
    pub max_size: usize,
    /// Live connections, including ones still being opened.
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
    /// Callers parked in `checkout`.
    pub waiting: usize,
}
