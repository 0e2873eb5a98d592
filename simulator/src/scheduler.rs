use std::collections::BTreeMap;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Picks which simulated task runs next, on a virtual millisecond clock.
///
/// Tasks are either ready or parked until a wake time. When nothing is ready the clock jumps
/// to the earliest wake time, so a run never waits on wall time.
pub(crate) struct Scheduler {
    ready: Vec<usize>,
    parked: BTreeMap<u64, Vec<usize>>,
    now_ms: u64,
}

impl Scheduler {
    pub(crate) fn new(task_count: usize) -> Self {
        Self {
            ready: (0..task_count).collect(),
            parked: BTreeMap::new(),
            now_ms: 0,
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub(crate) fn park(&mut self, task_id: usize, duration_ms: u64) {
        let wake_at = self.now_ms.saturating_add(duration_ms.max(1));
        self.parked.entry(wake_at).or_default().push(task_id);
    }

    pub(crate) fn requeue(&mut self, task_id: usize) {
        self.ready.push(task_id);
    }

    /// Advance the clock by one step and wake anything now due.
    pub(crate) fn tick(&mut self) {
        self.now_ms = self.now_ms.saturating_add(1);
        self.wake_due();
    }

    pub(crate) fn next(&mut self, rng: &mut ChaCha8Rng) -> Option<usize> {
        if self.ready.is_empty() {
            let (&wake_at, _) = self.parked.first_key_value()?;
            self.now_ms = wake_at;
            self.wake_due();
        }
        let idx = rng.random_range(0..self.ready.len());
        Some(self.ready.swap_remove(idx))
    }

    fn wake_due(&mut self) {
        while let Some(entry) = self.parked.first_entry() {
            if *entry.key() > self.now_ms {
                break;
            }
            self.ready.append(&mut entry.remove());
        }
    }
}
