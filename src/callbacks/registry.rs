use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::participant::ParticipantId;
use crate::error::SqlCoordinatorError;
use crate::tx_outcome::Outcome;

const INVALID_FILTER: &str = "`on` conditions for after_commit and after_rollback callbacks have to be one of [create, destroy, update]";

/// Why a participant joined a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Create,
    Update,
    Destroy,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Destroy => "destroy",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = SqlCoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ActionKind::Create),
            "update" => Ok(ActionKind::Update),
            "destroy" => Ok(ActionKind::Destroy),
            other => Err(SqlCoordinatorError::InvalidCallbackFilter(format!(
                "{INVALID_FILTER} (got {other:?})"
            ))),
        }
    }
}

/// Which action kinds a callback fires for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionFilter {
    Any,
    Only(Vec<ActionKind>),
}

impl ActionFilter {
    /// Build a filter from the string form used by persistence layers.
    ///
    /// # Errors
    /// Returns [`SqlCoordinatorError::InvalidCallbackFilter`] for an empty list or any value
    /// outside `create`, `update`, `destroy`.
    pub fn parse(on: &[&str]) -> Result<Self, SqlCoordinatorError> {
        let kinds = on
            .iter()
            .map(|raw| raw.parse::<ActionKind>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::only(&kinds)
    }

    /// # Errors
    /// Returns [`SqlCoordinatorError::InvalidCallbackFilter`] for an empty list.
    pub fn only(kinds: &[ActionKind]) -> Result<Self, SqlCoordinatorError> {
        if kinds.is_empty() {
            return Err(SqlCoordinatorError::InvalidCallbackFilter(format!(
                "{INVALID_FILTER} (got an empty list)"
            )));
        }
        let mut unique = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !unique.contains(kind) {
                unique.push(*kind);
            }
        }
        Ok(ActionFilter::Only(unique))
    }

    #[must_use]
    pub fn matches(&self, action: ActionKind) -> bool {
        match self {
            ActionFilter::Any => true,
            ActionFilter::Only(kinds) => kinds.contains(&action),
        }
    }
}

/// Passed to every callback invocation.
#[derive(Debug, Clone, Copy)]
pub struct Notification<'a> {
    pub participant: &'a ParticipantId,
    pub outcome: Outcome,
    pub action: ActionKind,
}

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
pub type CallbackHandler = Arc<dyn Fn(&Notification<'_>) -> Result<(), CallbackError> + Send + Sync>;

#[derive(Clone)]
pub struct CallbackDescriptor {
    pub outcome: Outcome,
    pub filter: ActionFilter,
    pub handler: CallbackHandler,
}

impl fmt::Debug for CallbackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDescriptor")
            .field("outcome", &self.outcome)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// The after-commit / after-rollback callbacks attached to one participant.
///
/// ```rust
/// use sql_coordinator::callbacks::TransactionCallbacks;
///
/// let callbacks = TransactionCallbacks::new()
///     .after_commit(|n| {
///         println!("{} committed", n.participant);
///         Ok(())
///     })
///     .after_rollback_on(&["create"], |_| Ok(()))
///     .unwrap();
/// assert_eq!(callbacks.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TransactionCallbacks {
    descriptors: Vec<CallbackDescriptor>,
}

impl TransactionCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn after_commit<F>(self, handler: F) -> Self
    where
        F: Fn(&Notification<'_>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.push(Outcome::Commit, ActionFilter::Any, handler)
    }

    /// # Errors
    /// Returns [`SqlCoordinatorError::InvalidCallbackFilter`] for an unknown action name.
    pub fn after_commit_on<F>(self, on: &[&str], handler: F) -> Result<Self, SqlCoordinatorError>
    where
        F: Fn(&Notification<'_>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Ok(self.push(Outcome::Commit, ActionFilter::parse(on)?, handler))
    }

    /// # Errors
    /// Returns [`SqlCoordinatorError::InvalidCallbackFilter`] for an empty list.
    pub fn after_commit_for<F>(
        self,
        kinds: &[ActionKind],
        handler: F,
    ) -> Result<Self, SqlCoordinatorError>
    where
        F: Fn(&Notification<'_>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Ok(self.push(Outcome::Commit, ActionFilter::only(kinds)?, handler))
    }

    #[must_use]
    pub fn after_rollback<F>(self, handler: F) -> Self
    where
        F: Fn(&Notification<'_>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.push(Outcome::Rollback, ActionFilter::Any, handler)
    }

    /// # Errors
    /// Returns [`SqlCoordinatorError::InvalidCallbackFilter`] for an unknown action name.
    pub fn after_rollback_on<F>(self, on: &[&str], handler: F) -> Result<Self, SqlCoordinatorError>
    where
        F: Fn(&Notification<'_>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Ok(self.push(Outcome::Rollback, ActionFilter::parse(on)?, handler))
    }

    /// # Errors
    /// Returns [`SqlCoordinatorError::InvalidCallbackFilter`] for an empty list.
    pub fn after_rollback_for<F>(
        self,
        kinds: &[ActionKind],
        handler: F,
    ) -> Result<Self, SqlCoordinatorError>
    where
        F: Fn(&Notification<'_>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Ok(self.push(Outcome::Rollback, ActionFilter::only(kinds)?, handler))
    }

    fn push<F>(mut self, outcome: Outcome, filter: ActionFilter, handler: F) -> Self
    where
        F: Fn(&Notification<'_>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.descriptors.push(CallbackDescriptor {
            outcome,
            filter,
            handler: Arc::new(handler),
        });
        self
    }

    /// Callbacks that fire for `outcome` on a participant recorded as `action`, most recently
    /// defined first.
    pub fn matching(
        &self,
        outcome: Outcome,
        action: ActionKind,
    ) -> impl Iterator<Item = &CallbackDescriptor> {
        self.descriptors
            .iter()
            .rev()
            .filter(move |d| d.outcome == outcome && d.filter.matches(action))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
