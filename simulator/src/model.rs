use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sql_coordinator::callbacks::{ActionKind, TransactionCallbacks};
use sql_coordinator::transaction::TransactionScope;
use sql_coordinator::{Outcome, PooledConnection};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Op {
    Checkout,
    Return,
    Begin { savepoint: bool },
    Commit,
    Rollback,
    Register(ActionKind),
    Execute,
    Select,
    KillSessions,
    FailNextCommit,
    Sleep(u64),
}

/// One simulated client: the connection it leases and the scopes it has opened on it.
#[derive(Debug)]
pub(crate) struct TaskState {
    pub(crate) id: usize,
    pub(crate) conn: Option<PooledConnection>,
    pub(crate) scopes: Vec<TransactionScope>,
    /// Participants registered since the outermost frame opened.
    pub(crate) participants: Vec<String>,
    next_participant: u64,
}

impl TaskState {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            conn: None,
            scopes: Vec::new(),
            participants: Vec::new(),
            next_participant: 1,
        }
    }

    pub(crate) fn conn_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|conn| conn.id())
    }

    /// Frames this task expects its connection to have open.
    pub(crate) fn opened(&self) -> usize {
        self.scopes
            .iter()
            .filter(|scope| matches!(scope, TransactionScope::Opened { .. }))
            .count()
    }

    pub(crate) fn next_participant_id(&mut self) -> String {
        let id = format!("t{}#{}", self.id, self.next_participant);
        self.next_participant += 1;
        id
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    registered: HashSet<String>,
    notified: HashMap<String, Vec<Outcome>>,
}

/// Records every registration and every callback invocation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Ledger {
    state: Arc<Mutex<LedgerState>>,
}

impl Ledger {
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn callbacks(&self) -> Arc<TransactionCallbacks> {
        let on_commit = self.clone();
        let on_rollback = self.clone();
        Arc::new(
            TransactionCallbacks::new()
                .after_commit(move |n| {
                    on_commit.notify(n.participant.to_string(), Outcome::Commit);
                    Ok(())
                })
                .after_rollback(move |n| {
                    on_rollback.notify(n.participant.to_string(), Outcome::Rollback);
                    Ok(())
                }),
        )
    }

    fn notify(&self, participant: String, outcome: Outcome) {
        self.lock().notified.entry(participant).or_default().push(outcome);
    }

    pub(crate) fn register(&self, participant: &str) {
        self.lock().registered.insert(participant.to_string());
    }

    pub(crate) fn registered(&self) -> usize {
        self.lock().registered.len()
    }

    pub(crate) fn is_notified(&self, participant: &str) -> bool {
        self.lock().notified.contains_key(participant)
    }

    /// Participants told more than once, or told without ever registering.
    pub(crate) fn violation(&self) -> Option<String> {
        let state = self.lock();
        state.notified.iter().find_map(|(participant, outcomes)| {
            if !state.registered.contains(participant) {
                Some(format!("{participant} notified without registering"))
            } else if outcomes.len() > 1 {
                Some(format!("{participant} notified {} times: {outcomes:?}", outcomes.len()))
            } else {
                None
            }
        })
    }

    pub(crate) fn pending(&self) -> Vec<String> {
        let state = self.lock();
        let mut pending: Vec<String> = state
            .registered
            .iter()
            .filter(|participant| !state.notified.contains_key(*participant))
            .cloned()
            .collect();
        pending.sort();
        pending
    }
}
