use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Mapping from pid to last-seen timestamp, shared between the event
/// source and the dispatcher. An entry with age < `window` suppresses
/// re-admission; entries are created on first admission, updated on each
/// suppressed re-observation, and reclaimed during idle scans.
///
/// All mutations are serialized through an internal mutex so the
/// "admitted decision happens-before sampler start" ordering holds even
/// when the event source and the dispatcher touch the table from
/// different threads.
pub struct DedupTable {
    window: Duration,
    entries: Mutex<HashMap<u32, Instant>>,
}

impl DedupTable {
    pub fn new(window: Duration) -> Self {
        DedupTable {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts to admit `pid` at `now`. Returns `true` ("fresh") if no
    /// entry exists or the existing entry is older than the dedup window,
    /// in which case the timestamp is updated so a closely-following
    /// duplicate is suppressed. Returns `false` if a recent entry already
    /// suppresses this pid.
    pub fn try_admit_at(&self, pid: u32, now: Instant) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&pid) {
            Some(last_seen) if now.duration_since(*last_seen) < self.window => false,
            Some(last_seen) => {
                *last_seen = now;
                true
            }
            None => {
                entries.insert(pid, now);
                true
            }
        }
    }

    pub fn try_admit(&self, pid: u32) -> bool {
        self.try_admit_at(pid, Instant::now())
    }

    /// Drops entries older than `window` so the table does not grow
    /// without bound under unbounded process churn.
    pub fn reap_expired_at(&self, now: Instant) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, last_seen| now.duration_since(*last_seen) < self.window);
    }

    pub fn reap_expired(&self) {
        self.reap_expired_at(Instant::now());
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
