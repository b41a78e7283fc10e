//! Per-process hardware-counter sampler (spec.md §4.3). Each sampler
//! owns four `HardwareCounter`s pinned to one pid, runs through
//! Opening → Running → Draining → Closed, and writes delta rows to its
//! multiplexer channel in `window.b`-sized batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};

use crate::config::{Config, K};
use crate::counters::{CounterSpec, HardwareCounter};
use crate::wire::encode_batch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Opening,
    Running,
    Draining,
    Closed,
}

pub type CounterFactory =
    Box<dyn Fn(CounterSpec, u32) -> crate::error::Result<Box<dyn HardwareCounter>> + Send>;

/// Spawns the sampler thread for `pid`, returning the receiving end of
/// its batch channel (to be registered with the `PipeRegistry`) and a
/// join handle. `open_counter` is injected so tests can substitute
/// `FakeCounter` for the real `perf_event_open`-backed one.
pub fn spawn_sampler(
    pid: u32,
    config: Config,
    open_counter: CounterFactory,
    stop_flag: Arc<AtomicBool>,
) -> (Receiver<Vec<u8>>, JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::unbounded();

    let handle = std::thread::Builder::new()
        .name(format!("sampler-{}", pid))
        .spawn(move || run_sampler(pid, config, open_counter, stop_flag, tx))
        .expect("failed to spawn sampler thread");

    (rx, handle)
}

fn run_sampler(
    pid: u32,
    config: Config,
    open_counter: CounterFactory,
    stop_flag: Arc<AtomicBool>,
    tx: Sender<Vec<u8>>,
) {
    let mut state = SamplerState::Opening;

    let mut counters: Vec<Box<dyn HardwareCounter>> = Vec::with_capacity(K);
    for spec in CounterSpec::ALL {
        match open_counter(spec, pid) {
            Ok(counter) => counters.push(counter),
            Err(e) => {
                warn!("sampler[{}]: failed to open {}: {}", pid, spec.name(), e);
                state = SamplerState::Closed;
                break;
            }
        }
    }

    if state == SamplerState::Closed {
        return;
    }

    state = SamplerState::Running;
    let mut rows: Vec<[u64; K]> = Vec::with_capacity(config.window.b);
    let mut batch_start = 0usize;
    let mut sample_index = 0usize;
    // The first row of a counter's stream is its raw first read, not a
    // delta (spec.md §3/§4.3); every row after that is current-previous
    // against the last *raw* reading.
    let mut prev: Option<[u64; K]> = None;
    // Last successfully-read raw value per counter, reused on a single
    // counter's read failure so that counter's cell goes unchanged for
    // the sample instead of aborting the whole sampler (spec.md §4.3/§7).
    let mut last_raw: [u64; K] = [0; K];

    while state == SamplerState::Running {
        if stop_flag.load(Ordering::Acquire) || sample_index >= config.total_samples {
            state = SamplerState::Draining;
            break;
        }

        std::thread::sleep(config.sample_interval);

        let current = read_all(pid, &mut counters, &mut last_raw);

        let row = match prev {
            None => current,
            Some(prev_values) => {
                let mut delta = [0u64; K];
                for i in 0..K {
                    delta[i] = current[i].wrapping_sub(prev_values[i]);
                }
                delta
            }
        };
        prev = Some(current);
        rows.push(row);
        sample_index += 1;

        if rows.len() == config.window.b {
            flush(pid, batch_start, &mut rows, &tx);
            batch_start = sample_index;
        }
    }

    if state == SamplerState::Draining {
        if !rows.is_empty() {
            flush(pid, batch_start, &mut rows, &tx);
        }
        state = SamplerState::Closed;
    }

    debug!("sampler[{}]: closed after {} samples", pid, sample_index);
    debug_assert_eq!(state, SamplerState::Closed);
    // Dropping `tx` here (end of scope) signals end-of-stream to the
    // multiplexer's `Select` loop.
}

/// Reads every counter independently. A read failure on one counter is
/// logged and that counter's cell reuses its last successfully-read raw
/// value (spec.md §4.3: "leave that counter's cell unchanged for that
/// sample"), rather than aborting the sampler — only an *open* failure
/// does that.
fn read_all(pid: u32, counters: &mut [Box<dyn HardwareCounter>], last_raw: &mut [u64; K]) -> [u64; K] {
    let mut values = [0u64; K];
    for (i, counter) in counters.iter_mut().enumerate() {
        match counter.read_raw() {
            Ok(v) => {
                last_raw[i] = v;
                values[i] = v;
            }
            Err(e) => {
                warn!(
                    "sampler[{}]: read failed for counter {}, reusing last value: {}",
                    pid,
                    CounterSpec::ALL[i].name(),
                    e
                );
                values[i] = last_raw[i];
            }
        }
    }
    values
}

fn flush(pid: u32, batch_start: usize, rows: &mut Vec<[u64; K]>, tx: &Sender<Vec<u8>>) {
    let chunk = encode_batch(pid, batch_start, rows);
    if tx.send(chunk).is_err() {
        debug!("sampler[{}]: multiplexer channel closed, dropping batch", pid);
    }
    rows.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::FakeCounter;
    use crate::wire::parse_batch;

    fn factory(series: Vec<Vec<u64>>) -> CounterFactory {
        Box::new(move |spec, _pid| {
            let idx = CounterSpec::ALL.iter().position(|s| *s == spec).unwrap();
            Ok(Box::new(FakeCounter::new(series[idx].clone())) as Box<dyn HardwareCounter>)
        })
    }

    #[test]
    fn first_row_is_raw_and_later_rows_are_deltas() {
        let mut config = Config::default();
        config.window.b = 2;
        config.total_samples = 4;
        config.sample_interval = Duration::from_millis(1);

        // cumulative counts, strictly increasing so deltas are non-zero.
        let series = vec![
            vec![0, 10, 20, 30, 40],
            vec![0, 1, 2, 3, 4],
            vec![0, 5, 10, 15, 20],
            vec![0, 0, 1, 1, 2],
        ];

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (rx, handle) = spawn_sampler(99, config, factory(series), stop_flag);

        let mut batches = Vec::new();
        while let Ok(chunk) = rx.recv_timeout(Duration::from_millis(500)) {
            batches.push(parse_batch(&chunk).unwrap());
        }
        handle.join().unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].pid, 99);
        assert_eq!(batches[0].start, 0);
        assert_eq!(batches[0].end, 1);
        assert_eq!(batches[1].start, 2);
        assert_eq!(batches[1].end, 3);
        // sample index 0 is the raw first read of each counter.
        assert_eq!(batches[0].rows[0], [0, 0, 0, 0]);
        // sample index 1 onward is current - previous raw reading.
        assert_eq!(batches[0].rows[1], [10, 1, 5, 0]);
        assert_eq!(batches[1].rows[0], [10, 1, 5, 1]);
        assert_eq!(batches[1].rows[1], [10, 1, 5, 0]);
    }

    #[test]
    fn stop_flag_drains_partial_batch() {
        let mut config = Config::default();
        config.window.b = 10;
        config.total_samples = 100;
        config.sample_interval = Duration::from_millis(1);

        let series = vec![
            (0..=100u64).collect(),
            (0..=100u64).collect(),
            (0..=100u64).collect(),
            (0..=100u64).collect(),
        ];

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (rx, handle) = spawn_sampler(1, config, factory(series), Arc::clone(&stop_flag));

        std::thread::sleep(Duration::from_millis(20));
        stop_flag.store(true, Ordering::Release);

        let mut batches = Vec::new();
        while let Ok(chunk) = rx.recv_timeout(Duration::from_millis(500)) {
            batches.push(parse_batch(&chunk).unwrap());
        }
        handle.join().unwrap();

        assert!(!batches.is_empty());
        assert!(batches.last().unwrap().rows.len() < 10);
    }

    /// A counter whose reads fail at specific call indices, modeling a
    /// transient short-read against one of the four counters while the
    /// underlying hardware count keeps advancing regardless.
    struct FlakyCounter {
        true_values: Vec<u64>,
        fail_at: std::collections::HashSet<usize>,
        call: usize,
    }

    impl HardwareCounter for FlakyCounter {
        fn read_raw(&mut self) -> crate::error::Result<u64> {
            let call = self.call;
            self.call += 1;
            if self.fail_at.contains(&call) {
                return Err(crate::error::Error::CounterRead(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "simulated read failure",
                )));
            }
            Ok(*self
                .true_values
                .get(call)
                .unwrap_or_else(|| self.true_values.last().unwrap()))
        }
    }

    #[test]
    fn counter_read_failure_reuses_last_value_without_draining() {
        let mut config = Config::default();
        config.window.b = 1;
        config.total_samples = 3;
        config.sample_interval = Duration::from_millis(1);

        let true_cycles = vec![0u64, 10, 30];
        let factory: CounterFactory = Box::new(move |spec, _pid| {
            if spec == CounterSpec::Cycles {
                Ok(Box::new(FlakyCounter {
                    true_values: true_cycles.clone(),
                    fail_at: [1].into_iter().collect(),
                    call: 0,
                }) as Box<dyn HardwareCounter>)
            } else {
                Ok(Box::new(FakeCounter::new(vec![0, 0, 0])) as Box<dyn HardwareCounter>)
            }
        });

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (rx, handle) = spawn_sampler(55, config, factory, stop_flag);

        let mut batches = Vec::new();
        while let Ok(chunk) = rx.recv_timeout(Duration::from_millis(500)) {
            batches.push(parse_batch(&chunk).unwrap());
        }
        handle.join().unwrap();

        assert_eq!(
            batches.len(),
            3,
            "a single counter's read failure must not terminate the sampler early"
        );
        // sample 0: raw first read succeeds, cycles column holds the raw value.
        assert_eq!(batches[0].rows[0][1], 0);
        // sample 1: the cycles read fails; the cell reuses the last raw value (0)
        // rather than the true-but-unread value (10), so its delta is 0.
        assert_eq!(batches[1].rows[0][1], 0);
        // sample 2: the cycles read succeeds again at the true raw value (30);
        // the delta against the reused last_raw (0) absorbs the missed sample
        // rather than shifting any subsequent index.
        assert_eq!(batches[2].rows[0][1], 30);
    }
}
