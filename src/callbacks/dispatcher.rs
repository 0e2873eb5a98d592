use tracing::{debug, error};

use super::participant::{Participant, ParticipantId};
use super::registry::{ActionKind, Notification};
use crate::tx_outcome::Outcome;

/// A callback error, captured instead of propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFailure {
    pub participant: ParticipantId,
    pub outcome: Outcome,
    pub action: ActionKind,
    pub message: String,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchReport {
    pub notified: usize,
    pub failures: Vec<CallbackFailure>,
}

impl DispatchReport {
    pub(crate) fn merge(&mut self, other: DispatchReport) {
        self.notified += other.notified;
        self.failures.extend(other.failures);
    }
}

/// Run the `outcome` callbacks of every participant, in registration order.
///
/// A failing handler stops the remaining handlers of its own participant only; the error is
/// logged and recorded in the report.
pub fn dispatch(outcome: Outcome, participants: &[Participant]) -> DispatchReport {
    let mut report = DispatchReport::default();
    for participant in participants {
        report.notified += 1;
        let notification = Notification {
            participant: &participant.id,
            outcome,
            action: participant.action,
        };
        for descriptor in participant.callbacks.matching(outcome, participant.action) {
            if let Err(e) = (descriptor.handler)(&notification) {
                error!(
                    participant = %participant.id,
                    %outcome,
                    action = %participant.action,
                    "after_{outcome} callback failed: {e}"
                );
                report.failures.push(CallbackFailure {
                    participant: participant.id.clone(),
                    outcome,
                    action: participant.action,
                    message: e.to_string(),
                });
                break;
            }
        }
    }
    if report.notified > 0 {
        debug!(%outcome, notified = report.notified, "dispatched transaction callbacks");
    }
    report
}
