use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy, mirroring the failure classes the agent
/// distinguishes between at runtime (see the error-handling design):
/// initialization errors are fatal and abort startup, transient/resource/
/// data errors are handled at the narrowest scope with context, and
/// catastrophic errors raise the global shutdown flag.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to attach the process-event probe: {0}")]
    ProbeAttach(String),

    #[error("failed to load model weights from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("failed to open a hardware counter: {0}")]
    CounterOpen(#[from] OpenError),

    #[error("failed to read a hardware counter: {0}")]
    CounterRead(std::io::Error),

    #[error("the sampler's channel was closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("too many live samplers (limit {limit})")]
    ResourceExhausted { limit: usize },

    #[error("malformed batch chunk: {0}")]
    Parse(String),

    #[error("process-creation event storm detected ({count} events in {window_ms} ms)")]
    Storm { count: usize, window_ms: u64 },
}

/// Errno classification for the `perf_event_open` syscall, grounded on the
/// manpage's ERRORS section (the same mapping the `perf_event_open`
/// wrapper crates in this family carry).
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(
        "perf_event_attr size is wrong (too small, too big, or the kernel \
         rewrote it to report the size it expected)"
    )]
    AttrWrongSize,
    #[error("the requested event requires CAP_SYS_ADMIN or a permissive perf_event_paranoid")]
    CapSysAdminRequired,
    #[error("group_fd or pid/cgroup fd is invalid")]
    InvalidFdOrPid,
    #[error("another event already has exclusive access to the PMU")]
    PmuBusy,
    #[error("the attr pointer points at invalid memory")]
    AttrInvalidPointer,
    #[error("the specified event configuration is invalid")]
    InvalidEvent,
    #[error("per-process open file descriptor limit reached")]
    TooManyOpenFiles,
    #[error("the requested event is not supported by this CPU")]
    CpuFeatureUnsupported,
    #[error("the event type is not valid")]
    InvalidEventType,
    #[error("attempted to attach to a process that does not exist")]
    ProcessDoesNotExist,
    #[error("perf_event_open returned an unexpected errno: {0}")]
    Unknown(nix::errno::Errno),
}

impl From<nix::errno::Errno> for OpenError {
    fn from(errno: nix::errno::Errno) -> OpenError {
        use nix::errno::Errno;
        match errno {
            Errno::E2BIG => OpenError::AttrWrongSize,
            Errno::EACCES => OpenError::CapSysAdminRequired,
            Errno::EBADF => OpenError::InvalidFdOrPid,
            Errno::EBUSY => OpenError::PmuBusy,
            Errno::EFAULT => OpenError::AttrInvalidPointer,
            Errno::EINVAL => OpenError::InvalidEvent,
            Errno::EMFILE => OpenError::TooManyOpenFiles,
            Errno::ENODEV => OpenError::CpuFeatureUnsupported,
            Errno::ENOENT => OpenError::InvalidEventType,
            Errno::ESRCH => OpenError::ProcessDoesNotExist,
            other => OpenError::Unknown(other),
        }
    }
}
