//! After-commit / after-rollback notifications for records that took part in a transaction.

mod dispatcher;
mod participant;
mod registry;

pub use dispatcher::{CallbackFailure, DispatchReport, dispatch};
pub use participant::{Participant, ParticipantId};
pub use registry::{
    ActionFilter, ActionKind, CallbackDescriptor, CallbackError, CallbackHandler, Notification,
    TransactionCallbacks,
};
