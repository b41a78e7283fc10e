//! Shared registry of live sampler channels (spec.md §3, §4.4): the
//! Dispatcher appends an entry when it spawns a sampler, the Multiplexer
//! rebuilds its `Select` set from a snapshot each loop iteration, and
//! entries are removed once their sampler's channel disconnects.

use std::sync::Mutex;

use crossbeam_channel::Receiver;

use crate::error::{Error, Result};

pub type ProcessId = u32;

struct Entry {
    pid: ProcessId,
    rx: Receiver<Vec<u8>>,
}

/// Append-only (modulo removal) table of `(pid, receiver)` pairs, capped
/// at `max_pids` live entries (spec.md's MAX_PIDS back-pressure).
pub struct PipeRegistry {
    max_pids: usize,
    entries: Mutex<Vec<Entry>>,
}

impl PipeRegistry {
    pub fn new(max_pids: usize) -> Self {
        PipeRegistry {
            max_pids,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new sampler's receiving end. Fails with
    /// `ResourceExhausted` once `max_pids` live samplers are already
    /// registered; the caller is expected to drop-and-log the spawn.
    pub fn register(&self, pid: ProcessId, rx: Receiver<Vec<u8>>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_pids {
            return Err(Error::ResourceExhausted {
                limit: self.max_pids,
            });
        }
        entries.push(Entry { pid, rx });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry for `pid` (a sampler that reported end of
    /// stream or errored out).
    pub fn remove(&self, pid: ProcessId) {
        self.entries.lock().unwrap().retain(|e| e.pid != pid);
    }

    /// A point-in-time snapshot of `(pid, receiver)` pairs, suitable for
    /// building a fresh `crossbeam_channel::Select` around; cloning a
    /// `Receiver` is cheap (it is a shared handle onto the same channel).
    pub fn snapshot(&self) -> Vec<(ProcessId, Receiver<Vec<u8>>)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.pid, e.rx.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_snapshot() {
        let registry = PipeRegistry::new(2);
        let (_tx1, rx1) = crossbeam_channel::unbounded();
        let (_tx2, rx2) = crossbeam_channel::unbounded();
        registry.register(1, rx1).unwrap();
        registry.register(2, rx2).unwrap();
        assert_eq!(registry.len(), 2);
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn rejects_beyond_max_pids() {
        let registry = PipeRegistry::new(1);
        let (_tx1, rx1) = crossbeam_channel::unbounded();
        let (_tx2, rx2) = crossbeam_channel::unbounded();
        registry.register(1, rx1).unwrap();
        assert!(matches!(
            registry.register(2, rx2),
            Err(Error::ResourceExhausted { limit: 1 })
        ));
    }

    #[test]
    fn remove_drops_entry() {
        let registry = PipeRegistry::new(4);
        let (_tx, rx) = crossbeam_channel::unbounded();
        registry.register(7, rx).unwrap();
        registry.remove(7);
        assert!(registry.is_empty());
    }
}
