use std::time::Duration;

/// Fixed cardinality of the counter set: the core recognizes exactly four
/// named hardware counters.
pub const K: usize = 4;

/// The four counter names the core recognizes, in their fixed order.
pub const COUNTER_NAMES: [&str; K] = [
    "instructions",
    "cycles",
    "branch-instructions",
    "branch-misses",
];

/// Window/model shape. The source inconsistently uses B=10 (online) vs
/// B=30 (offline) and INPUT_DIM=40 vs 120; both are preserved as
/// configuration rather than hardcoded, per the design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowShape {
    /// Rows per batch/inference window.
    pub b: usize,
    /// Hidden/input dimension is `b * K`.
    pub k: usize,
}

impl WindowShape {
    pub const fn input_dim(&self) -> usize {
        self.b * self.k
    }

    /// The online agent's window: B=10, INPUT_DIM=40.
    pub const ONLINE: WindowShape = WindowShape { b: 10, k: K };

    /// The offline training variant's window: B=30, INPUT_DIM=120.
    pub const OFFLINE: WindowShape = WindowShape { b: 30, k: K };
}

/// Tunable configuration for a running agent. Defaults match every
/// constant spec.md names; all are overridable from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub model_path: String,
    pub window: WindowShape,
    pub max_pids: usize,
    pub dedup_window: Duration,
    pub idle_timeout: Duration,
    pub sample_interval: Duration,
    pub total_samples: usize,
    pub storm_threshold: usize,
    pub storm_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            model_path: "model_weights.bin".to_string(),
            window: WindowShape::ONLINE,
            max_pids: 1024,
            dedup_window: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
            sample_interval: Duration::from_millis(10),
            total_samples: 30,
            storm_threshold: 10,
            storm_window: Duration::from_millis(1),
        }
    }
}
