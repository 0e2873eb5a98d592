use std::fmt;

use crate::callbacks::CallbackFailure;

/// How a transaction frame ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Commit,
    Rollback,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Commit => f.write_str("commit"),
            Outcome::Rollback => f.write_str("rollback"),
        }
    }
}

/// Lifecycle of a transaction frame. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Open,
    Committed,
    RolledBack,
}

impl FrameState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, FrameState::Open)
    }
}

/// Value a transaction body hands back to say how its frame should end.
///
/// `Rollback` is the deliberate-rollback signal: it ends the frame that opened the
/// transaction without surfacing as an error to anyone further out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxControl<T> {
    Commit(T),
    Rollback,
}

/// What happened when a frame was closed.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseReport {
    /// Depth of the frame the scope referred to.
    pub depth: usize,
    /// Terminal state of the frame, or `Open` when the scope had joined an outer frame.
    pub state: FrameState,
    /// Participants that were dispatched to.
    pub notified: usize,
    /// Callback errors, isolated per participant and never re-raised.
    pub callback_failures: Vec<CallbackFailure>,
}

impl CloseReport {
    pub(crate) fn joined(depth: usize) -> Self {
        Self {
            depth,
            state: FrameState::Open,
            notified: 0,
            callback_failures: Vec::new(),
        }
    }

    /// True when closing was a bookkeeping no-op because the scope joined an outer frame.
    #[must_use]
    pub fn was_joined(&self) -> bool {
        self.state == FrameState::Open
    }
}
