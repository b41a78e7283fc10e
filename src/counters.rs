//! Hardware performance counters (spec.md §4.2): opens one
//! `perf_event_open` file descriptor per named counter, pinned to a
//! target pid, and exposes a cumulative-count read. The sampler is
//! responsible for turning successive reads into deltas.

use std::fs::File;
use std::io::Read;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use log::warn;
use nix::errno::Errno;

use crate::config::COUNTER_NAMES;
use crate::error::{Error, OpenError, Result};
use crate::raw::{perf_event_attr, perf_hw_id, perf_type_id};

// `perf_event_open`'s ioctl surface (spec.md §6): RESET clears the
// counter, ENABLE starts it counting, DISABLE stops it before close.
// Magic/op numbers per `linux/perf_event.h`.
const PERF_EVENT_IOC_MAGIC: u8 = b'$';
nix::ioctl_none!(perf_event_ioc_enable, PERF_EVENT_IOC_MAGIC, 0);
nix::ioctl_none!(perf_event_ioc_disable, PERF_EVENT_IOC_MAGIC, 1);
nix::ioctl_none!(perf_event_ioc_reset, PERF_EVENT_IOC_MAGIC, 3);

/// The four named hardware counters the core recognizes, in their fixed
/// order (must match `config::COUNTER_NAMES`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterSpec {
    Instructions,
    Cycles,
    BranchInstructions,
    BranchMisses,
}

impl CounterSpec {
    pub const ALL: [CounterSpec; 4] = [
        CounterSpec::Instructions,
        CounterSpec::Cycles,
        CounterSpec::BranchInstructions,
        CounterSpec::BranchMisses,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CounterSpec::Instructions => COUNTER_NAMES[0],
            CounterSpec::Cycles => COUNTER_NAMES[1],
            CounterSpec::BranchInstructions => COUNTER_NAMES[2],
            CounterSpec::BranchMisses => COUNTER_NAMES[3],
        }
    }

    fn hw_config(&self) -> u32 {
        match self {
            CounterSpec::Instructions => perf_hw_id::PERF_COUNT_HW_INSTRUCTIONS,
            CounterSpec::Cycles => perf_hw_id::PERF_COUNT_HW_CPU_CYCLES,
            CounterSpec::BranchInstructions => perf_hw_id::PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
            CounterSpec::BranchMisses => perf_hw_id::PERF_COUNT_HW_BRANCH_MISSES,
        }
    }

    pub fn from_name(name: &str) -> Option<CounterSpec> {
        CounterSpec::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// What the sampler needs from a counter: a cumulative, monotonically
/// non-decreasing 64-bit count since the counter was opened.
pub trait HardwareCounter: Send {
    fn read_raw(&mut self) -> Result<u64>;
}

/// A real hardware counter opened against a specific process via
/// `perf_event_open(2)`.
pub struct PerfCounter {
    file: File,
}

impl PerfCounter {
    /// Opens `spec`, counting only while `pid` is scheduled on any CPU
    /// (`cpu = -1`), with no group leader, not inherited into children
    /// (each child gets its own counter via its own sampler). The
    /// attribute block is opened `disabled=1` and then explicitly reset
    /// and enabled via IOCTL, per spec.md §6 and the reference
    /// collector's `create_event_attr`/`collect_perf_events`.
    pub fn open(spec: CounterSpec, pid: i32) -> Result<Self> {
        let mut attr: perf_event_attr = unsafe { mem::zeroed() };
        attr.size = mem::size_of::<perf_event_attr>() as u32;
        attr.type_ = perf_type_id::PERF_TYPE_HARDWARE;
        attr.config = spec.hw_config() as u64;
        attr.set_disabled(1);
        attr.set_exclude_kernel(0);
        attr.set_exclude_hv(1);
        attr.set_inherit(0);

        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const perf_event_attr,
                pid,
                -1i32, // any cpu
                -1i32, // no group leader
                0u64,  // flags
            )
        };

        if fd < 0 {
            let errno = Errno::last();
            return Err(Error::CounterOpen(OpenError::from(errno)));
        }

        // SAFETY: perf_event_open returned a freshly-opened, uniquely
        // owned fd on success.
        let file = unsafe { File::from_raw_fd(fd as RawFd) };
        let raw_fd = file.as_raw_fd();

        // SAFETY: raw_fd is the perf_event fd just opened above.
        unsafe { perf_event_ioc_reset(raw_fd) }
            .map_err(|e| Error::CounterOpen(OpenError::from(e)))?;
        unsafe { perf_event_ioc_enable(raw_fd) }
            .map_err(|e| Error::CounterOpen(OpenError::from(e)))?;

        Ok(PerfCounter { file })
    }
}

impl HardwareCounter for PerfCounter {
    fn read_raw(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact(&mut buf)
            .map_err(Error::CounterRead)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

impl Drop for PerfCounter {
    /// Counter descriptors are always disabled before close, on every
    /// exit path (spec.md §4.3). `File`'s own `Drop` closes the fd
    /// immediately after.
    fn drop(&mut self) {
        let raw_fd = self.file.as_raw_fd();
        // SAFETY: raw_fd is still open; we are mid-drop of its owner.
        if let Err(e) = unsafe { perf_event_ioc_disable(raw_fd) } {
            warn!("failed to disable perf counter fd {}: {}", raw_fd, e);
        }
    }
}

/// A deterministic stand-in for `PerfCounter`, used by sampler tests and
/// the classifier/window tests so they do not depend on perf_event_open
/// being available (e.g. inside a container without CAP_PERFMON).
pub struct FakeCounter {
    values: std::collections::VecDeque<u64>,
    last: u64,
}

impl FakeCounter {
    pub fn new(values: Vec<u64>) -> Self {
        FakeCounter {
            values: values.into(),
            last: 0,
        }
    }
}

impl HardwareCounter for FakeCounter {
    fn read_raw(&mut self) -> Result<u64> {
        if let Some(v) = self.values.pop_front() {
            self.last = v;
        }
        Ok(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_spec_names_match_config_order() {
        for (spec, name) in CounterSpec::ALL.iter().zip(COUNTER_NAMES.iter()) {
            assert_eq!(spec.name(), *name);
        }
    }

    #[test]
    fn from_name_round_trips() {
        for spec in CounterSpec::ALL {
            assert_eq!(CounterSpec::from_name(spec.name()), Some(spec));
        }
        assert_eq!(CounterSpec::from_name("not-a-counter"), None);
    }

    #[test]
    fn fake_counter_holds_last_value_past_exhaustion() {
        let mut counter = FakeCounter::new(vec![10, 25, 25]);
        assert_eq!(counter.read_raw().unwrap(), 10);
        assert_eq!(counter.read_raw().unwrap(), 25);
        assert_eq!(counter.read_raw().unwrap(), 25);
        assert_eq!(counter.read_raw().unwrap(), 25);
    }
}
