use std::fmt;
use std::sync::Arc;

use super::registry::{ActionKind, TransactionCallbacks};

/// Identity of a domain record taking part in a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(Arc<str>);

impl ParticipantId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Conventional `model#id` identity.
    pub fn record(model: &str, id: impl fmt::Display) -> Self {
        Self(format!("{model}#{id}").into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A registered participant: who, why it joined, and the callbacks to run when its
/// transaction ends.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub action: ActionKind,
    pub callbacks: Arc<TransactionCallbacks>,
}

impl Participant {
    pub fn new(
        id: impl Into<ParticipantId>,
        action: ActionKind,
        callbacks: Arc<TransactionCallbacks>,
    ) -> Self {
        Self {
            id: id.into(),
            action,
            callbacks,
        }
    }
}
