//! Windowed inference engine (spec.md §4.5/§4.6): accumulates delta rows
//! per pid into a bounded buffer, fires the classifier every
//! `window.b` rows, and evicts idle processes so memory does not grow
//! without bound across process churn.

pub mod classifier;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::info;

use crate::config::{WindowShape, K};
use crate::wire::ParsedBatch;
use classifier::{ModelWeights, Verdict};

/// Per-pid accumulation buffer. Capped at `MAX_ROWS` so a pid that
/// never triggers an eviction (e.g. a batch size that never lines up
/// with `window.b`, though the sampler always emits exactly `b`-sized
/// batches) cannot grow unbounded.
struct WindowBuffer {
    rows: VecDeque<[u64; K]>,
    last_update: Instant,
}

const MAX_ROWS: usize = 90;

impl WindowBuffer {
    fn new(now: Instant) -> Self {
        WindowBuffer {
            rows: VecDeque::new(),
            last_update: now,
        }
    }

    fn push_rows(&mut self, rows: &[[u64; K]], now: Instant) {
        for row in rows {
            self.rows.push_back(*row);
        }
        while self.rows.len() > MAX_ROWS {
            self.rows.pop_front();
        }
        self.last_update = now;
    }

    /// Takes the most recent `b` rows as the next inference window, but
    /// only once the buffer has advanced by exactly a window stride
    /// (spec.md §4.5: `buffer.len % B == 0`), so a short trailing
    /// (draining) batch that does not land on a stride boundary does not
    /// trigger a spurious extra inference.
    fn take_window(&self, b: usize) -> Option<Vec<[u64; K]>> {
        if self.rows.is_empty() || self.rows.len() % b != 0 {
            return None;
        }
        let skip = self.rows.len() - b;
        Some(self.rows.iter().skip(skip).copied().collect())
    }
}

/// One verdict the engine has produced for a pid's latest window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub pid: u32,
    pub verdict: Verdict,
}

pub struct Engine {
    buffers: HashMap<u32, WindowBuffer>,
    model: ModelWeights,
    window: WindowShape,
    idle_timeout: Duration,
}

impl Engine {
    pub fn new(model: ModelWeights, window: WindowShape, idle_timeout: Duration) -> Self {
        Engine {
            buffers: HashMap::new(),
            model,
            window,
            idle_timeout,
        }
    }

    /// Folds one parsed batch into its pid's buffer, returning a
    /// classification whenever the buffer's new length lands exactly on
    /// a window-stride boundary. The sampler emits `window.b`-sized
    /// batches except for its final draining batch, which can be
    /// shorter; that case is handled by the stride check in
    /// `WindowBuffer::take_window` rather than assumed away.
    pub fn on_batch(&mut self, batch: ParsedBatch) -> Option<Classification> {
        self.on_batch_at(batch, Instant::now())
    }

    fn on_batch_at(&mut self, batch: ParsedBatch, now: Instant) -> Option<Classification> {
        let buffer = self
            .buffers
            .entry(batch.pid)
            .or_insert_with(|| WindowBuffer::new(now));
        buffer.push_rows(&batch.rows, now);

        let window_rows = buffer.take_window(self.window.b)?;
        let input: Vec<f32> = window_rows
            .iter()
            .flat_map(|row| row.iter().map(|&v| v as f32))
            .collect();
        let verdict = self.model.classify(&input);
        info!("inference: pid {} classified as {:?}", batch.pid, verdict);
        Some(Classification {
            pid: batch.pid,
            verdict,
        })
    }

    /// Drops buffers that have not received a batch within
    /// `idle_timeout` (spec.md's `T_idle` eviction). Intended to be
    /// called periodically from the multiplexer's idle ticks.
    pub fn reap_idle(&mut self) {
        self.reap_idle_at(Instant::now());
    }

    fn reap_idle_at(&mut self, now: Instant) {
        self.buffers
            .retain(|_, buf| now.duration_since(buf.last_update) < self.idle_timeout);
    }

    #[cfg(test)]
    fn live_pids(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowShape;

    fn batch(pid: u32, start: usize, rows: Vec<[u64; K]>) -> ParsedBatch {
        let end = start + rows.len() - 1;
        ParsedBatch {
            pid,
            start,
            end,
            rows,
        }
    }

    #[test]
    fn classifies_once_per_complete_window() {
        let window = WindowShape { b: 2, k: K };
        let model = ModelWeights::zeroed(window.input_dim());
        let mut engine = Engine::new(model, window, Duration::from_secs(10));

        assert!(engine
            .on_batch_at(batch(1, 0, vec![[1, 1, 1, 1]]), Instant::now())
            .is_none());

        let verdict = engine
            .on_batch_at(batch(1, 1, vec![[2, 2, 2, 2]]), Instant::now())
            .unwrap();
        assert_eq!(verdict.pid, 1);
        assert_eq!(verdict.verdict, Verdict::Benign);
    }

    #[test]
    fn off_stride_trailing_batch_does_not_fire_early() {
        let window = WindowShape { b: 10, k: K };
        let model = ModelWeights::zeroed(window.input_dim());
        let mut engine = Engine::new(model, window, Duration::from_secs(10));

        let rows: Vec<[u64; K]> = (0..10).map(|i| [i as u64, 0, 0, 0]).collect();
        assert!(engine
            .on_batch_at(batch(1, 0, rows), Instant::now())
            .is_some());

        // A short draining batch lands the buffer on 13 rows, not a
        // multiple of the b=10 stride, so no inference should fire yet.
        let trailing: Vec<[u64; K]> = (10..13).map(|i| [i as u64, 0, 0, 0]).collect();
        assert!(engine
            .on_batch_at(batch(1, 10, trailing), Instant::now())
            .is_none());
    }

    #[test]
    fn idle_eviction_drops_only_expired_pids() {
        let window = WindowShape { b: 1, k: K };
        let model = ModelWeights::zeroed(window.input_dim());
        let mut engine = Engine::new(model, window, Duration::from_secs(10));

        let t0 = Instant::now();
        engine.on_batch_at(batch(1, 0, vec![[1, 1, 1, 1]]), t0);
        engine.on_batch_at(batch(2, 0, vec![[1, 1, 1, 1]]), t0 + Duration::from_secs(8));

        engine.reap_idle_at(t0 + Duration::from_secs(11));

        assert_eq!(engine.live_pids(), 1);
    }

    #[test]
    fn buffer_is_capped_at_max_rows() {
        let window = WindowShape { b: 1, k: K };
        let model = ModelWeights::zeroed(window.input_dim());
        let mut engine = Engine::new(model, window, Duration::from_secs(10));

        let now = Instant::now();
        for i in 0..(MAX_ROWS + 10) {
            engine.on_batch_at(batch(1, i, vec![[i as u64, 0, 0, 0]]), now);
        }

        let buf = engine.buffers.get(&1).unwrap();
        assert_eq!(buf.rows.len(), MAX_ROWS);
    }
}
