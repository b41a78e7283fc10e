//! Cooperative shutdown (spec.md §6/§7): a single `Arc<AtomicBool>`
//! stop flag raised by SIGINT/SIGTERM or by any component detecting a
//! catastrophic failure (storm, probe death). Every polling loop in the
//! crate checks the flag at least once every 100ms, so shutdown
//! latency is bounded regardless of which component raised it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::error;

/// Registers SIGINT/SIGTERM handlers that set `flag` to `true`. Returns
/// the same `flag` back so callers can thread it through without a
/// second `Arc::clone` at the call site.
pub fn install_signal_handlers(flag: Arc<AtomicBool>) -> std::io::Result<Arc<AtomicBool>> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))?;
    Ok(flag)
}

/// Raises `flag` and logs why, at `error!` level per spec.md §7's "every
/// fatal condition is printed to the diagnostic stream" requirement, for
/// components (storm detection, a dead probe) that must force a
/// shutdown themselves rather than wait for a signal.
pub fn raise(flag: &AtomicBool, reason: &str) {
    error!("raising shutdown flag: {}", reason);
    flag.store(true, Ordering::Release);
}

pub fn is_stopping(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_sets_the_flag() {
        let flag = AtomicBool::new(false);
        assert!(!is_stopping(&flag));
        raise(&flag, "test");
        assert!(is_stopping(&flag));
    }
}
