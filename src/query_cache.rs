//! Scoped read-result cache.
//!
//! Each connection owns a [`QueryCache`]. A [`QueryCacheScope`] switches it on for a unit of
//! work (typically one external request) and, however that unit ends, clears the cached
//! results and restores the flag it found on entry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use regex::Regex;

use crate::results::ResultSet;
use crate::types::RowValues;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("static whitespace pattern");
}

/// Cache key for a read: the SQL with whitespace collapsed plus its binds.
#[must_use]
pub fn fingerprint(sql: &str, binds: &[RowValues]) -> String {
    let mut key = WHITESPACE.replace_all(sql.trim(), " ").into_owned();
    for bind in binds {
        key.push('\u{1f}');
        key.push_str(&bind.fingerprint());
    }
    key
}

#[derive(Debug, Default)]
pub struct QueryCacheState {
    enabled: bool,
    results: HashMap<String, Arc<ResultSet>>,
    hits: u64,
    misses: u64,
}

/// Shared handle to one connection's query cache.
#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    state: Arc<Mutex<QueryCacheState>>,
}

impl QueryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueryCacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn enable(&self) {
        self.lock().enabled = true;
    }

    /// Turn caching off. Cached results are kept until the next [`QueryCache::clear`].
    pub fn disable(&self) {
        self.lock().enabled = false;
    }

    pub fn clear(&self) {
        self.lock().results.clear();
    }

    /// Cached result for `key`, if caching is on and the key was stored.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Arc<ResultSet>> {
        let mut state = self.lock();
        if !state.enabled {
            return None;
        }
        let found = state.results.get(key).cloned();
        if found.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        found
    }

    /// Store a result. Ignored while caching is off.
    pub fn store(&self, key: String, result: Arc<ResultSet>) {
        let mut state = self.lock();
        if state.enabled {
            state.results.insert(key, result);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().results.is_empty()
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.lock().hits
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.lock().misses
    }

    /// Run `work` with caching enabled, restoring the prior state afterwards.
    pub async fn cache<F>(&self, work: F) -> F::Output
    where
        F: Future,
    {
        let scope = QueryCacheScope::enter(self);
        let output = work.await;
        scope.exit();
        output
    }

    /// Run `work` with caching disabled, restoring the prior flag afterwards.
    pub async fn uncached<F>(&self, work: F) -> F::Output
    where
        F: Future,
    {
        let scope = QueryCacheScope::enter_uncached(self);
        let output = work.await;
        scope.exit();
        output
    }
}

/// RAII guard around an enabled (or disabled) stretch of a [`QueryCache`].
///
/// Dropping the guard without calling [`QueryCacheScope::exit`] performs the same restore,
/// so errors, panics and cancelled futures all leave the cache as they found it.
#[derive(Debug)]
#[must_use = "the previous cache state is restored when the scope is dropped"]
pub struct QueryCacheScope {
    cache: QueryCache,
    previously_enabled: bool,
    clear_on_exit: bool,
    finished: bool,
}

impl QueryCacheScope {
    pub fn enter(cache: &QueryCache) -> Self {
        let previously_enabled = {
            let mut state = cache.lock();
            let previous = state.enabled;
            state.enabled = true;
            previous
        };
        Self {
            cache: cache.clone(),
            previously_enabled,
            clear_on_exit: true,
            finished: false,
        }
    }

    pub fn enter_uncached(cache: &QueryCache) -> Self {
        let previously_enabled = {
            let mut state = cache.lock();
            let previous = state.enabled;
            state.enabled = false;
            previous
        };
        Self {
            cache: cache.clone(),
            previously_enabled,
            clear_on_exit: false,
            finished: false,
        }
    }

    #[must_use]
    pub fn previously_enabled(&self) -> bool {
        self.previously_enabled
    }

    pub fn exit(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut state = self.cache.lock();
        if self.clear_on_exit {
            state.results.clear();
        }
        state.enabled = self.previously_enabled;
    }
}

impl Drop for QueryCacheScope {
    fn drop(&mut self) {
        self.finish();
    }
}
