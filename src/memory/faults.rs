use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct FaultState {
    fail_commits: usize,
    fail_releases: usize,
    fail_connects: usize,
    failing_sql: Vec<String>,
    fail_deallocate: bool,
    kill_epoch: u64,
    latency: Duration,
}

/// Faults shared by every session of one [`super::MemoryFactory`].
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    state: Arc<Mutex<FaultState>>,
}

impl FaultPlan {
    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `COMMIT` on any session fails.
    pub fn fail_next_commit(&self) {
        self.lock().fail_commits += 1;
    }

    pub fn fail_next_release_savepoint(&self) {
        self.lock().fail_releases += 1;
    }

    pub fn fail_next_connect(&self) {
        self.lock().fail_connects += 1;
    }

    /// Every statement containing `pattern` fails until [`FaultPlan::clear_sql_failures`].
    pub fn fail_sql(&self, pattern: impl Into<String>) {
        self.lock().failing_sql.push(pattern.into());
    }

    pub fn clear_sql_failures(&self) {
        self.lock().failing_sql.clear();
    }

    pub fn fail_deallocate(&self, fail: bool) {
        self.lock().fail_deallocate = fail;
    }

    /// Kill every session opened so far. Sessions opened afterwards are healthy.
    pub fn kill_all(&self) {
        self.lock().kill_epoch += 1;
    }

    /// Delay applied to every native call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.lock().kill_epoch
    }

    pub(crate) async fn pause(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub(crate) fn take_commit_failure(&self) -> bool {
        take(&mut self.lock().fail_commits)
    }

    pub(crate) fn take_release_failure(&self) -> bool {
        take(&mut self.lock().fail_releases)
    }

    pub(crate) fn take_connect_failure(&self) -> bool {
        take(&mut self.lock().fail_connects)
    }

    pub(crate) fn sql_fails(&self, sql: &str) -> bool {
        self.lock().failing_sql.iter().any(|p| sql.contains(p.as_str()))
    }

    pub(crate) fn deallocate_fails(&self) -> bool {
        self.lock().fail_deallocate
    }
}

fn take(counter: &mut usize) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    true
}
