use std::collections::HashMap;

use sql_coordinator::ConnectionPool;

use crate::model::{Ledger, TaskState};

pub(crate) struct Oracle;

impl Oracle {
    /// Invariants that must hold between any two steps.
    pub(crate) fn check(
        tasks: &[TaskState],
        pool: &ConnectionPool,
        ledger: &Ledger,
    ) -> Result<(), String> {
        let mut owners = HashMap::new();
        for task in tasks {
            let Some(conn) = task.conn.as_ref() else {
                if !task.scopes.is_empty() {
                    return Err(format!("task {} has open scopes without a connection", task.id));
                }
                continue;
            };
            if let Some(other) = owners.insert(conn.id(), task.id) {
                return Err(format!(
                    "conn {} leased to tasks {other} and {} at once",
                    conn.id(),
                    task.id
                ));
            }
            if conn.open_transactions() != task.opened() {
                return Err(format!(
                    "task {} expects {} open frames on conn {}, connection reports {}",
                    task.id,
                    task.opened(),
                    conn.id(),
                    conn.open_transactions()
                ));
            }
        }

        let stats = pool.stats();
        if stats.size > stats.max_size {
            return Err(format!("pool grew to {} past its limit {}", stats.size, stats.max_size));
        }
        if stats.leased != owners.len() {
            return Err(format!(
                "pool reports {} leased connections, tasks hold {}",
                stats.leased,
                owners.len()
            ));
        }
        if stats.waiting != 0 {
            return Err(format!("{} waiters left behind after checkout", stats.waiting));
        }

        match ledger.violation() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Every participant of a finished outer transaction has heard its outcome.
    pub(crate) fn check_settled(task: &TaskState, ledger: &Ledger) -> Result<(), String> {
        match task
            .participants
            .iter()
            .find(|participant| !ledger.is_notified(participant))
        {
            Some(participant) => Err(format!(
                "task {} closed its transaction but {participant} was never notified",
                task.id
            )),
            None => Ok(()),
        }
    }

    /// After every task has returned its connection.
    pub(crate) fn check_drained(pool: &ConnectionPool, ledger: &Ledger) -> Result<(), String> {
        let stats = pool.stats();
        if stats.leased != 0 {
            return Err(format!("{} connections still leased after drain", stats.leased));
        }
        let pending = ledger.pending();
        if !pending.is_empty() {
            return Err(format!("participants never notified: {pending:?}"));
        }
        ledger.violation().map_or(Ok(()), Err)
    }
}
