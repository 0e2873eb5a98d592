use crate::adapter::IsolationLevel;

/// How a `transaction` / `begin_transaction` call should relate to an already open frame.
///
/// ```rust
/// use sql_coordinator::adapter::IsolationLevel;
/// use sql_coordinator::transaction::TransactionOptions;
///
/// let nested = TransactionOptions::new().requiring_new();
/// assert!(nested.requires_new);
///
/// let outer = TransactionOptions::new().with_isolation(IsolationLevel::Serializable);
/// assert!(outer.joinable);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Open a savepoint even when a frame is already open.
    pub requires_new: bool,
    /// Whether later calls without `requires_new` may join the frame this call opens.
    pub joinable: bool,
    /// Only honoured when this call opens the real (depth 0) transaction.
    pub isolation: Option<IsolationLevel>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            requires_new: false,
            joinable: true,
            isolation: None,
        }
    }
}

impl TransactionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn requiring_new(mut self) -> Self {
        self.requires_new = true;
        self
    }

    #[must_use]
    pub fn not_joinable(mut self) -> Self {
        self.joinable = false;
        self
    }

    #[must_use]
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }
}
