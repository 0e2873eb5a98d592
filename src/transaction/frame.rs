use crate::callbacks::{Participant, ParticipantId};
use crate::tx_outcome::FrameState;

/// Deterministic savepoint name for a frame depth.
#[must_use]
pub fn savepoint_name(depth: usize) -> String {
    format!("savepoint_{depth}")
}

/// One level of nesting on a connection's frame stack.
#[derive(Debug)]
pub struct TransactionFrame {
    depth: usize,
    state: FrameState,
    savepoint: Option<String>,
    joinable: bool,
    participants: Vec<Participant>,
}

impl TransactionFrame {
    pub(crate) fn new(depth: usize, joinable: bool) -> Self {
        let savepoint = (depth > 0).then(|| savepoint_name(depth));
        Self {
            depth,
            state: FrameState::Open,
            savepoint,
            joinable,
            participants: Vec::new(),
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// `None` for the real transaction at depth 0.
    #[must_use]
    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    #[must_use]
    pub fn is_joinable(&self) -> bool {
        self.joinable
    }

    /// Participants in registration order.
    #[must_use]
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| &p.id == id)
    }

    pub(crate) fn register(&mut self, participant: Participant) {
        self.participants.push(participant);
    }

    /// Merge a released child frame's participants, keeping the first registration of each id.
    pub(crate) fn absorb(&mut self, participants: Vec<Participant>) {
        for participant in participants {
            if !self.contains(&participant.id) {
                self.participants.push(participant);
            }
        }
    }

    pub(crate) fn finish(&mut self, state: FrameState) -> Vec<Participant> {
        self.state = state;
        std::mem::take(&mut self.participants)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::callbacks::{ActionKind, TransactionCallbacks};

    fn participant(id: &str, action: ActionKind) -> Participant {
        Participant::new(id, action, Arc::new(TransactionCallbacks::new()))
    }

    #[test]
    fn only_nested_frames_carry_a_savepoint() {
        assert_eq!(TransactionFrame::new(0, true).savepoint(), None);
        assert_eq!(
            TransactionFrame::new(2, true).savepoint(),
            Some("savepoint_2")
        );
    }

    #[test]
    fn absorb_keeps_the_first_action_kind() {
        let mut parent = TransactionFrame::new(0, true);
        parent.register(participant("topic#1", ActionKind::Create));
        parent.absorb(vec![
            participant("topic#1", ActionKind::Update),
            participant("reply#7", ActionKind::Destroy),
        ]);

        let seen: Vec<_> = parent
            .participants()
            .iter()
            .map(|p| (p.id.as_str(), p.action))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("topic#1", ActionKind::Create),
                ("reply#7", ActionKind::Destroy)
            ]
        );
    }

    #[test]
    fn finish_is_terminal_and_drains() {
        let mut frame = TransactionFrame::new(1, true);
        frame.register(participant("a#1", ActionKind::Create));
        let drained = frame.finish(FrameState::RolledBack);
        assert_eq!(drained.len(), 1);
        assert!(frame.state().is_terminal());
        assert!(frame.participants().is_empty());
    }
}
