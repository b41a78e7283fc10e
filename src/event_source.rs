//! Process-Event Source (spec.md §4.1): publishes deduplicated
//! process-creation pids to a sink, self-excludes the agent and its
//! children, and raises the global stop flag on a process-creation
//! storm.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::control;
use crate::probe::RawProbe;

pub type EventSink = Box<dyn Fn(u32) + Send + Sync>;

/// Contract a process-creation source must satisfy (spec.md §4.1).
pub trait ProcessEventSource: Send {
    /// Begins delivery to `sink`. Fails if the underlying probe cannot
    /// be attached.
    fn start(&mut self, sink: EventSink) -> crate::error::Result<()>;

    /// Adds `pid` to the kernel-side exclude set.
    fn exclude(&mut self, pid: u32) -> crate::error::Result<()>;

    /// Detaches the probe and joins its polling thread.
    fn stop(&mut self);
}

/// Generic wrapper around any `RawProbe` that adds the kernel-side
/// ("nanosecond resolution") dedup layer and storm detection the spec
/// requires of every event source, regardless of backend.
pub struct EventSourceTask<P: RawProbe + 'static> {
    probe: Option<P>,
    stop_flag: Arc<AtomicBool>,
    fatal_flag: Arc<AtomicBool>,
    storm_threshold: usize,
    storm_window: Duration,
    dedup_window: Duration,
    handle: Option<JoinHandle<()>>,
}

impl<P: RawProbe + 'static> EventSourceTask<P> {
    /// `fatal_flag` is distinct from `stop_flag`: both halt every loop
    /// in the crate, but only `fatal_flag` distinguishes a
    /// catastrophic shutdown (storm, dead probe) from a clean one
    /// (SIGINT/SIGTERM), so `main` can choose its exit code.
    pub fn new(
        probe: P,
        stop_flag: Arc<AtomicBool>,
        fatal_flag: Arc<AtomicBool>,
        storm_threshold: usize,
        storm_window: Duration,
        dedup_window: Duration,
    ) -> Self {
        EventSourceTask {
            probe: Some(probe),
            stop_flag,
            fatal_flag,
            storm_threshold,
            storm_window,
            dedup_window,
            handle: None,
        }
    }
}

impl<P: RawProbe + 'static> ProcessEventSource for EventSourceTask<P> {
    fn start(&mut self, sink: EventSink) -> crate::error::Result<()> {
        let mut probe = self
            .probe
            .take()
            .ok_or_else(|| crate::error::Error::ProbeAttach("already started".into()))?;

        let stop_flag = Arc::clone(&self.stop_flag);
        let fatal_flag = Arc::clone(&self.fatal_flag);
        let storm_threshold = self.storm_threshold;
        let storm_window = self.storm_window;
        let dedup_window = self.dedup_window;

        let handle = std::thread::Builder::new()
            .name("event-source".into())
            .spawn(move || {
                let mut kernel_side: std::collections::HashMap<u32, Instant> =
                    std::collections::HashMap::new();
                let mut recent_events: VecDeque<Instant> = VecDeque::new();

                while !control::is_stopping(&stop_flag) {
                    match probe.poll(Duration::from_millis(100)) {
                        Ok(Some(event)) => {
                            let now = Instant::now();

                            recent_events.push_back(now);
                            while let Some(&front) = recent_events.front() {
                                if now.duration_since(front) > storm_window {
                                    recent_events.pop_front();
                                } else {
                                    break;
                                }
                            }
                            if recent_events.len() > storm_threshold {
                                control::raise(
                                    &fatal_flag,
                                    &format!(
                                        "event-source: process-creation storm detected \
                                         ({} events within {:?})",
                                        recent_events.len(),
                                        storm_window
                                    ),
                                );
                                stop_flag.store(true, Ordering::Release);
                                break;
                            }

                            let fresh = match kernel_side.get(&event.pid) {
                                Some(last) if now.duration_since(*last) < dedup_window => false,
                                _ => {
                                    kernel_side.insert(event.pid, now);
                                    true
                                }
                            };

                            if fresh {
                                debug!("event-source: admitting pid {}", event.pid);
                                sink(event.pid);
                            } else {
                                debug!("event-source: suppressing recently-seen pid {}", event.pid);
                            }

                            kernel_side.retain(|_, ts| now.duration_since(*ts) < dedup_window);
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            control::raise(
                                &fatal_flag,
                                &format!("event-source: probe failed: {}", e),
                            );
                            stop_flag.store(true, Ordering::Release);
                            break;
                        }
                    }
                }
                info!("event-source: exiting");
            })
            .expect("failed to spawn event-source thread");

        self.handle = Some(handle);
        Ok(())
    }

    fn exclude(&mut self, pid: u32) -> crate::error::Result<()> {
        if let Some(probe) = self.probe.as_mut() {
            probe
                .exclude(pid)
                .map_err(|e| crate::error::Error::ProbeAttach(e.to_string()))?;
        } else {
            warn!(
                "event-source: exclude({}) requested after start(); probe ownership has \
                 moved to the polling thread, exclusion must be wired through the probe \
                 before start() for this pid to take effect",
                pid
            );
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
