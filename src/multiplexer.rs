//! Multiplexer (spec.md §4.4): the single consumer thread that fans in
//! every live sampler's channel. `crossbeam_channel::Select` does not
//! support adding receivers to an already-built selector, so membership
//! is re-snapshotted from the `PipeRegistry` and a fresh `Select` is
//! built every loop iteration; a 100ms timeout bounds how stale that
//! snapshot can be against newly registered or newly-closed samplers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Select, TryRecvError};
use log::{trace, warn};

use crate::pipe_registry::PipeRegistry;
use crate::wire::{parse_batch, ParsedBatch};

const SELECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Drains every sampler channel registered in `registry` until
/// `stop_flag` is raised, calling `on_batch` for each successfully
/// parsed chunk. Malformed chunks are logged and skipped; they never
/// abort the loop.
pub fn run_multiplexer(
    registry: Arc<PipeRegistry>,
    stop_flag: Arc<AtomicBool>,
    mut on_batch: impl FnMut(ParsedBatch),
) {
    while !stop_flag.load(Ordering::Acquire) {
        let snapshot = registry.snapshot();
        if snapshot.is_empty() {
            std::thread::sleep(SELECT_TIMEOUT);
            continue;
        }

        let mut select = Select::new();
        for (_, rx) in &snapshot {
            select.recv(rx);
        }

        let index = match select.ready_timeout(SELECT_TIMEOUT) {
            Ok(index) => index,
            Err(_) => continue,
        };

        let (pid, rx) = &snapshot[index];
        match rx.try_recv() {
            Ok(chunk) => match parse_batch(&chunk) {
                Ok(batch) => on_batch(batch),
                Err(e) => warn!("multiplexer: dropping malformed batch from pid {}: {}", pid, e),
            },
            Err(TryRecvError::Empty) => {
                trace!("multiplexer: spurious wakeup for pid {}", pid);
            }
            Err(TryRecvError::Disconnected) => {
                trace!("multiplexer: pid {} sampler closed, deregistering", pid);
                registry.remove(*pid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_batch;
    use std::sync::Mutex;

    #[test]
    fn fans_in_multiple_samplers_and_deregisters_on_close() {
        let registry = Arc::new(PipeRegistry::new(8));
        let (tx1, rx1) = crossbeam_channel::unbounded();
        let (tx2, rx2) = crossbeam_channel::unbounded();
        registry.register(1, rx1).unwrap();
        registry.register(2, rx2).unwrap();

        tx1.send(encode_batch(1, 0, &[[1, 1, 1, 1]])).unwrap();
        tx2.send(encode_batch(2, 0, &[[2, 2, 2, 2]])).unwrap();
        drop(tx1);
        drop(tx2);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let registry_clone = Arc::clone(&registry);
        let stop_clone = Arc::clone(&stop_flag);

        let handle = std::thread::spawn(move || {
            run_multiplexer(registry_clone, stop_clone, |batch| {
                received_clone.lock().unwrap().push(batch.pid);
            });
        });

        std::thread::sleep(Duration::from_millis(350));
        stop_flag.store(true, Ordering::Release);
        handle.join().unwrap();

        let mut pids = received.lock().unwrap().clone();
        pids.sort();
        assert_eq!(pids, vec![1, 2]);
        assert!(registry.is_empty());
    }
}
