#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sql_coordinator::callbacks::{ActionKind, TransactionCallbacks};
use sql_coordinator::memory::MemoryFactory;
use sql_coordinator::{ConnectionPool, PoolConfig};

/// Collects callback invocations as `"<label> <participant>"` strings.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    /// Unfiltered after_commit / after_rollback handlers.
    pub fn callbacks(&self) -> Arc<TransactionCallbacks> {
        let on_commit = self.clone();
        let on_rollback = self.clone();
        Arc::new(
            TransactionCallbacks::new()
                .after_commit(move |n| {
                    on_commit.push(format!("commit {}", n.participant));
                    Ok(())
                })
                .after_rollback(move |n| {
                    on_rollback.push(format!("rollback {}", n.participant));
                    Ok(())
                }),
        )
    }

    /// One handler per outcome and action kind, recorded as e.g. `"commit_on_create a#1"`.
    pub fn filtered(&self) -> Arc<TransactionCallbacks> {
        let mut callbacks = TransactionCallbacks::new();
        for kind in [ActionKind::Create, ActionKind::Update, ActionKind::Destroy] {
            let commit = self.clone();
            let rollback = self.clone();
            callbacks = callbacks
                .after_commit_for(&[kind], move |n| {
                    commit.push(format!("commit_on_{kind} {}", n.participant));
                    Ok(())
                })
                .unwrap()
                .after_rollback_for(&[kind], move |n| {
                    rollback.push(format!("rollback_on_{kind} {}", n.participant));
                    Ok(())
                })
                .unwrap();
        }
        Arc::new(callbacks)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

pub fn memory_pool(size: usize, timeout: Duration) -> (ConnectionPool, MemoryFactory) {
    let factory = MemoryFactory::new();
    let config = PoolConfig::builder()
        .max_size(size)
        .checkout_timeout(timeout)
        .build()
        .unwrap();
    let pool = ConnectionPool::new(config, Arc::new(factory.clone())).unwrap();
    (pool, factory)
}
