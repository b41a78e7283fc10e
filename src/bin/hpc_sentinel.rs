//! `hpc-sentinel`: the online agent. Wires the process-event probe,
//! dispatcher, samplers, multiplexer and inference engine together and
//! runs until SIGINT/SIGTERM or a catastrophic failure.

use std::os::unix::io::RawFd;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use hpc_sentinel::config::Config;
use hpc_sentinel::control;
use hpc_sentinel::dedup::DedupTable;
use hpc_sentinel::dispatcher::Dispatcher;
use hpc_sentinel::event_source::{EventSourceTask, ProcessEventSource};
use hpc_sentinel::inference::classifier::ModelWeights;
use hpc_sentinel::inference::Engine;
use hpc_sentinel::multiplexer::run_multiplexer;
use hpc_sentinel::pipe_registry::PipeRegistry;
use hpc_sentinel::probe::FdRawProbe;

/// Host-resident HPC-based process malware classifier.
#[derive(Parser, Debug)]
#[command(name = "hpc-sentinel", about)]
struct Cli {
    /// Path to the trained classifier weights.
    #[arg(long, default_value = "model_weights.bin")]
    model: String,

    /// Path to the fd/pipe the kernel-side process-creation probe
    /// writes pid records to.
    #[arg(long, default_value = "/var/run/hpc-sentinel/probe.pipe")]
    probe_path: String,

    /// Optional path written to for kernel-side pid exclusion.
    #[arg(long)]
    exclude_path: Option<String>,

    /// Maximum number of concurrently tracked processes.
    #[arg(long, default_value_t = 1024)]
    max_pids: usize,

    /// Dedup window, in seconds.
    #[arg(long, default_value_t = 5)]
    dedup_secs: u64,

    /// Idle eviction timeout, in seconds.
    #[arg(long, default_value_t = 10)]
    idle_secs: u64,

    /// Sampling interval, in milliseconds.
    #[arg(long, default_value_t = 10)]
    sample_interval_ms: u64,

    /// Total samples collected per process before a sampler closes.
    #[arg(long, default_value_t = 30)]
    total_samples: usize,

    /// Rows per inference window (online default 10, offline 30).
    #[arg(long, default_value_t = 10)]
    window_stride: usize,

    /// Events tolerated within `storm_window_ms` before shutdown.
    #[arg(long, default_value_t = 10)]
    storm_threshold: usize,

    /// Storm detection window, in milliseconds.
    #[arg(long, default_value_t = 1)]
    storm_window_ms: u64,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = Config::default();
    config.model_path = cli.model.clone();
    config.max_pids = cli.max_pids;
    config.dedup_window = Duration::from_secs(cli.dedup_secs);
    config.idle_timeout = Duration::from_secs(cli.idle_secs);
    config.sample_interval = Duration::from_millis(cli.sample_interval_ms);
    config.total_samples = cli.total_samples;
    config.window.b = cli.window_stride;
    config.storm_threshold = cli.storm_threshold;
    config.storm_window = Duration::from_millis(cli.storm_window_ms);

    match run(cli, config) {
        Ok(fatal) if fatal => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal startup error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: Config) -> hpc_sentinel::error::Result<bool> {
    let model = ModelWeights::load(&config.model_path, config.window.input_dim())?;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let fatal_flag = Arc::new(AtomicBool::new(false));
    control::install_signal_handlers(Arc::clone(&stop_flag))
        .map_err(|e| hpc_sentinel::error::Error::ProbeAttach(e.to_string()))?;

    let dedup = Arc::new(DedupTable::new(config.dedup_window));
    let registry = Arc::new(PipeRegistry::new(config.max_pids));
    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        Arc::clone(&dedup),
        Arc::clone(&registry),
        Arc::clone(&stop_flag),
    ));

    let probe_file = std::fs::File::open(&cli.probe_path)
        .map_err(|e| hpc_sentinel::error::Error::ProbeAttach(e.to_string()))?;
    let probe_fd: RawFd = std::os::unix::io::AsRawFd::as_raw_fd(&probe_file);
    std::mem::forget(probe_file); // FdRawProbe takes ownership of the fd

    let exclude_fd: Option<RawFd> = match &cli.exclude_path {
        Some(path) => {
            let f = std::fs::OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| hpc_sentinel::error::Error::ProbeAttach(e.to_string()))?;
            let fd = std::os::unix::io::AsRawFd::as_raw_fd(&f);
            std::mem::forget(f);
            Some(fd)
        }
        None => None,
    };

    let probe = FdRawProbe::new(probe_fd, exclude_fd)
        .map_err(|e| hpc_sentinel::error::Error::ProbeAttach(e.to_string()))?;

    let mut event_source = EventSourceTask::new(
        probe,
        Arc::clone(&stop_flag),
        Arc::clone(&fatal_flag),
        config.storm_threshold,
        config.storm_window,
        config.dedup_window,
    );

    // Self-exclusion (spec.md §4.1): the agent must never classify
    // itself or any helper process it spawns.
    event_source.exclude(std::process::id())?;

    {
        let dispatcher = Arc::clone(&dispatcher);
        event_source.start(Box::new(move |pid| dispatcher.on_event(pid)))?;
    }

    let engine = Arc::new(Mutex::new(Engine::new(
        model,
        config.window,
        config.idle_timeout,
    )));

    let multiplexer_handle = {
        let registry = Arc::clone(&registry);
        let stop_flag = Arc::clone(&stop_flag);
        let engine = Arc::clone(&engine);
        std::thread::Builder::new()
            .name("multiplexer".into())
            .spawn(move || {
                run_multiplexer(registry, stop_flag, move |batch| {
                    if let Some(classification) = engine.lock().unwrap().on_batch(batch) {
                        info!(
                            "verdict: pid {} => {:?}",
                            classification.pid, classification.verdict
                        );
                    }
                });
            })
            .expect("failed to spawn multiplexer thread")
    };

    let reaper_handle = {
        let stop_flag = Arc::clone(&stop_flag);
        let engine = Arc::clone(&engine);
        std::thread::Builder::new()
            .name("idle-reaper".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_secs(1));
                    engine.lock().unwrap().reap_idle();
                }
            })
            .expect("failed to spawn idle-reaper thread")
    };

    while !stop_flag.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("hpc-sentinel: shutting down");
    event_source.stop();
    dispatcher.shutdown();
    let _ = multiplexer_handle.join();
    let _ = reaper_handle.join();

    Ok(fatal_flag.load(Ordering::Acquire))
}
