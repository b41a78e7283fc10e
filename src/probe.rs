//! The kernel-side tracepoint hook is an external collaborator (see
//! spec.md §1); this module defines the interface it must satisfy — a
//! readiness-bounded stream of raw pid records plus a pid exclude map —
//! and ships two implementations: a real one that polls an externally
//! supplied file descriptor with `mio` (matching the "poll with timeout"
//! contract in spec.md §6), and a channel-backed one used by the core
//! pipeline's own tests and by the offline collector.

use std::collections::HashSet;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crossbeam_channel::Receiver;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// One raw process-creation record as the kernel probe contract defines
/// it: "records of ≥4 bytes beginning with a little-endian 32-bit pid".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPidEvent {
    pub pid: u32,
}

/// What the event source needs from the kernel-side probe: a bounded
/// poll for the next record, and a way to add pids to the kernel-side
/// exclude map so the probe never reports them again.
pub trait RawProbe: Send {
    /// Waits up to `timeout` for the next record. `Ok(None)` on timeout,
    /// `Err` if the probe itself failed (fatal, propagates to shutdown).
    fn poll(&mut self, timeout: Duration) -> std::io::Result<Option<RawPidEvent>>;

    /// Adds `pid` to the exclude set; subsequent events for that pid are
    /// suppressed at the source.
    fn exclude(&mut self, pid: u32) -> std::io::Result<()>;
}

const PROBE_TOKEN: Token = Token(0);
/// One record's worth of scratch space; the contract only requires the
/// leading 4 bytes, but real kernel records (pid + comm, as in the
/// reference eBPF program) run a little larger.
const RECORD_BUF_LEN: usize = 64;

/// Polls an externally-supplied file descriptor (e.g. a perf event ring
/// buffer or a pinned BPF map's notification fd) for process-creation
/// records, and maintains a parallel user-space exclude set alongside
/// whatever real exclude map the caller wires `exclude_fd` to.
pub struct FdRawProbe {
    poll: Poll,
    events: Events,
    fd: RawFd,
    file: std::fs::File,
    exclude_fd: Option<RawFd>,
    excluded: HashSet<u32>,
}

impl FdRawProbe {
    /// `fd` is the readable endpoint the kernel-side hook writes events
    /// to; `exclude_fd`, if given, is written `pid` + a non-zero byte to
    /// update the kernel-side exclude map (see spec.md §6).
    pub fn new(fd: RawFd, exclude_fd: Option<RawFd>) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&fd), PROBE_TOKEN, Interest::READABLE)?;
        Ok(FdRawProbe {
            poll,
            events: Events::with_capacity(16),
            fd,
            // SAFETY: `fd` is owned by the caller for the lifetime of this
            // probe; we only ever read from the duplicate-free File view.
            file: unsafe { std::os::unix::io::FromRawFd::from_raw_fd(fd) },
            exclude_fd,
            excluded: HashSet::new(),
        })
    }
}

impl RawProbe for FdRawProbe {
    fn poll(&mut self, timeout: Duration) -> std::io::Result<Option<RawPidEvent>> {
        self.events.clear();
        self.poll.poll(&mut self.events, Some(timeout))?;

        if self.events.iter().next().is_none() {
            return Ok(None);
        }

        let mut buf = [0u8; RECORD_BUF_LEN];
        let n = self.file.read(&mut buf)?;
        if n < 4 {
            return Ok(None);
        }
        let pid = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if self.excluded.contains(&pid) {
            return Ok(None);
        }
        Ok(Some(RawPidEvent { pid }))
    }

    fn exclude(&mut self, pid: u32) -> std::io::Result<()> {
        self.excluded.insert(pid);
        if let Some(exclude_fd) = self.exclude_fd {
            use std::io::Write;
            let mut record = [0u8; 5];
            record[..4].copy_from_slice(&pid.to_le_bytes());
            record[4] = 1;
            // SAFETY: exclude_fd is a caller-owned, write-capable fd for
            // the lifetime of this probe.
            let mut f: std::fs::File =
                unsafe { std::os::unix::io::FromRawFd::from_raw_fd(exclude_fd) };
            let result = f.write_all(&record);
            std::mem::forget(f); // do not close a fd we do not own
            result?;
        }
        Ok(())
    }
}

impl AsRawFd for FdRawProbe {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// A deterministic, in-process stand-in for the kernel probe, used by
/// tests and by the offline collector binary. `pid=0` on the channel is
/// interpreted as end-of-stream.
pub struct ChannelRawProbe {
    events: Receiver<RawPidEvent>,
    excluded: HashSet<u32>,
}

impl ChannelRawProbe {
    pub fn new(events: Receiver<RawPidEvent>) -> Self {
        ChannelRawProbe {
            events,
            excluded: HashSet::new(),
        }
    }
}

impl RawProbe for ChannelRawProbe {
    fn poll(&mut self, timeout: Duration) -> std::io::Result<Option<RawPidEvent>> {
        loop {
            match self.events.recv_timeout(timeout) {
                Ok(event) if self.excluded.contains(&event.pid) => continue,
                Ok(event) => return Ok(Some(event)),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => return Ok(None),
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    fn exclude(&mut self, pid: u32) -> std::io::Result<()> {
        self.excluded.insert(pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_probe_filters_excluded_pids() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut probe = ChannelRawProbe::new(rx);
        probe.exclude(99).unwrap();
        tx.send(RawPidEvent { pid: 99 }).unwrap();
        tx.send(RawPidEvent { pid: 100 }).unwrap();
        let event = probe.poll(Duration::from_millis(50)).unwrap().unwrap();
        assert_eq!(event.pid, 100);
    }

    #[test]
    fn channel_probe_times_out() {
        let (_tx, rx) = crossbeam_channel::unbounded::<RawPidEvent>();
        let mut probe = ChannelRawProbe::new(rx);
        assert!(probe.poll(Duration::from_millis(10)).unwrap().is_none());
    }
}
