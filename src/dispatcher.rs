//! Dispatcher (spec.md §4.2): the sole authority deciding whether a
//! process-creation event is admitted. Owns the shared `DedupTable` and
//! `PipeRegistry`, and turns an admitted pid into a running sampler
//! whose receiver is registered for the multiplexer to pick up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{info, warn};

use crate::config::Config;
use crate::counters::{CounterSpec, HardwareCounter, PerfCounter};
use crate::dedup::DedupTable;
use crate::pipe_registry::PipeRegistry;
use crate::sampler::{spawn_sampler, CounterFactory};

pub struct Dispatcher {
    config: Config,
    dedup: Arc<DedupTable>,
    registry: Arc<PipeRegistry>,
    stop_flag: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        config: Config,
        dedup: Arc<DedupTable>,
        registry: Arc<PipeRegistry>,
        stop_flag: Arc<AtomicBool>,
    ) -> Self {
        Dispatcher {
            config,
            dedup,
            registry,
            stop_flag,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Idempotent within the dedup window: a pid already admitted
    /// recently is silently ignored. Spawns a real `PerfCounter`-backed
    /// sampler for newly admitted pids, unless the registry is already at
    /// `max_pids` — checked *before* spawning, so an over-capacity event
    /// never opens real hardware counters or starts an untracked thread
    /// (spec.md §4.2's "drop the incoming event" back-pressure).
    pub fn on_event(&self, pid: u32) {
        if !self.dedup.try_admit(pid) {
            return;
        }

        if self.registry.len() >= self.config.max_pids {
            warn!(
                "dispatcher: dropping pid {}, already at max_pids ({})",
                pid, self.config.max_pids
            );
            return;
        }

        let factory: CounterFactory = Box::new(|spec: CounterSpec, pid: u32| {
            PerfCounter::open(spec, pid as i32)
                .map(|c| Box::new(c) as Box<dyn HardwareCounter>)
        });

        let (rx, handle) =
            spawn_sampler(pid, self.config.clone(), factory, Arc::clone(&self.stop_flag));
        // Tracked for `shutdown` immediately, before the registration
        // below, so a sampler thread is never left unjoined even if the
        // registry's own check below loses a capacity race.
        self.handles.lock().unwrap().push(handle);

        match self.registry.register(pid, rx) {
            Ok(()) => {
                info!("dispatcher: admitted pid {} ({} live)", pid, self.registry.len());
            }
            Err(e) => warn!(
                "dispatcher: pid {} lost a capacity race after its sampler had already \
                 started: {}",
                pid, e
            ),
        }
    }

    /// Raises the shared stop flag (every live sampler observes it at
    /// its next sleep wake-up or channel write, per spec.md §5) and
    /// joins every sampler thread spawned so far.
    pub fn shutdown(&self) {
        self.stop_flag.store(true, Ordering::Release);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::FakeCounter;
    use crate::sampler::spawn_sampler as spawn_sampler_direct;
    use std::time::Duration;

    fn test_dispatcher(max_pids: usize) -> Dispatcher {
        let mut config = Config::default();
        config.total_samples = 1;
        config.sample_interval = Duration::from_millis(1);
        Dispatcher::new(
            config,
            Arc::new(DedupTable::new(Duration::from_secs(5))),
            Arc::new(PipeRegistry::new(max_pids)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn repeated_events_for_same_pid_are_idempotent() {
        let dispatcher = test_dispatcher(8);
        dispatcher.on_event(42);
        dispatcher.on_event(42);
        assert_eq!(dispatcher.registry.len(), 1);
    }

    #[test]
    fn distinct_pids_each_get_a_sampler() {
        let dispatcher = test_dispatcher(8);
        dispatcher.on_event(1);
        dispatcher.on_event(2);
        assert_eq!(dispatcher.registry.len(), 2);
    }

    #[test]
    fn shutdown_raises_stop_flag_and_joins_every_sampler() {
        let registry = Arc::new(PipeRegistry::new(4));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut config = Config::default();
        config.window.b = 1;
        config.total_samples = 1;
        config.sample_interval = Duration::from_millis(1);
        let dispatcher = Dispatcher::new(
            config,
            Arc::new(DedupTable::new(Duration::from_secs(5))),
            Arc::clone(&registry),
            Arc::clone(&stop_flag),
        );

        dispatcher.on_event(1);
        dispatcher.on_event(2);
        assert_eq!(dispatcher.handles.lock().unwrap().len(), 2);

        dispatcher.shutdown();

        assert!(stop_flag.load(Ordering::Acquire));
        assert!(dispatcher.handles.lock().unwrap().is_empty());
    }

    #[test]
    fn resource_exhaustion_drops_beyond_max_pids() {
        let dispatcher = test_dispatcher(1);
        dispatcher.on_event(1);
        dispatcher.on_event(2);
        assert_eq!(dispatcher.registry.len(), 1);
        // The over-capacity event must never spawn a sampler at all, not
        // merely fail to register one.
        assert_eq!(dispatcher.handles.lock().unwrap().len(), 1);
    }

    // Exercises the non-PerfCounter sampler path directly, since
    // `Dispatcher::on_event` always wires the real hardware backend.
    #[test]
    fn registry_receiver_yields_fake_counter_batches() {
        let registry = Arc::new(PipeRegistry::new(4));
        let mut config = Config::default();
        config.window.b = 1;
        config.total_samples = 1;
        config.sample_interval = Duration::from_millis(1);

        let factory: CounterFactory = Box::new(|_spec, _pid| {
            Ok(Box::new(FakeCounter::new(vec![0, 5])) as Box<dyn HardwareCounter>)
        });
        let (rx, handle) =
            spawn_sampler_direct(77, config, factory, Arc::new(AtomicBool::new(false)));
        registry.register(77, rx).unwrap();
        handle.join().unwrap();
        assert_eq!(registry.len(), 1);
    }
}
