//! Per-connection cache of prepared statements.
//!
//! Entries remember the process that prepared them. After a fork the child observes a new
//! process id and every inherited entry reads as a miss, so a native handle that belongs to
//! the parent's session is never reused.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::adapter::PreparedHandle;

/// Source of the current process id. Injectable so tests can simulate a fork.
pub type PidSource = Arc<dyn Fn() -> u32 + Send + Sync>;

/// [`PidSource`] backed by [`std::process::id`].
#[must_use]
pub fn current_process_id() -> PidSource {
    Arc::new(std::process::id)
}

#[derive(Debug, Clone)]
struct StatementCacheEntry {
    handle: PreparedHandle,
    last_used: u64,
    owner_pid: u32,
}

pub struct StatementCache {
    entries: HashMap<String, StatementCacheEntry>,
    limit: usize,
    tick: u64,
    pid: PidSource,
}

impl StatementCache {
    #[must_use]
    pub fn new(limit: usize, pid: PidSource) -> Self {
        Self {
            entries: HashMap::new(),
            limit,
            tick: 0,
            pid,
        }
    }

    /// Look up a prepared handle. Entries prepared by another process are misses.
    pub fn fetch(&mut self, key: &str) -> Option<PreparedHandle> {
        let pid = (self.pid)();
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        if entry.owner_pid != pid {
            return None;
        }
        entry.last_used = tick;
        Some(entry.handle.clone())
    }

    /// Insert a handle, returning any handles of this process that must now be deallocated:
    /// a replaced entry and the least-recently-used entries beyond the limit.
    pub fn put(&mut self, key: impl Into<String>, handle: PreparedHandle) -> Vec<PreparedHandle> {
        let pid = (self.pid)();
        let tick = self.next_tick();
        let mut evicted = Vec::new();

        let previous = self.entries.insert(
            key.into(),
            StatementCacheEntry {
                handle: handle.clone(),
                last_used: tick,
                owner_pid: pid,
            },
        );
        if let Some(old) = previous
            && old.owner_pid == pid
            && old.handle != handle
        {
            evicted.push(old.handle);
        }

        while self.entries.len() > self.limit {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest)
                && entry.owner_pid == pid
            {
                evicted.push(entry.handle);
            }
        }
        evicted
    }

    /// Empty the cache, returning the handles this process still owns.
    pub fn clear(&mut self) -> Vec<PreparedHandle> {
        let pid = (self.pid)();
        self.entries
            .drain()
            .filter(|(_, entry)| entry.owner_pid == pid)
            .map(|(_, entry)| entry.handle)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

impl fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.entries.len())
            .field("limit", &self.limit)
            .finish()
    }
}
