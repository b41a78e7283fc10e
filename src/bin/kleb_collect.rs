//! `kleb-collect`: offline feature collector. Samples a single
//! already-running pid's hardware counters at the same cadence the
//! online agent uses and writes raw deltas to a CSV file, for building
//! the training set the classifier's offline (B=30) variant is fit
//! against.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;

use hpc_sentinel::counters::{CounterSpec, HardwareCounter, PerfCounter};
use hpc_sentinel::error::{Error, Result};

/// Offline hardware-counter feature collector.
#[derive(Parser, Debug)]
#[command(name = "kleb-collect", about)]
struct Cli {
    /// The pid to sample.
    pid: i32,

    /// Counters to collect; defaults to all four named counters, in
    /// their fixed order.
    #[arg(long, value_delimiter = ',')]
    events: Option<Vec<String>>,

    /// Output CSV path.
    #[arg(long, default_value = "samples.csv")]
    out: PathBuf,

    /// Number of samples to collect.
    #[arg(long, default_value_t = 30)]
    samples: usize,

    /// Sampling interval, in milliseconds.
    #[arg(long, default_value_t = 10)]
    interval_ms: u64,

    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli) {
        eprintln!("kleb-collect: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let specs: Vec<CounterSpec> = match &cli.events {
        Some(names) => names
            .iter()
            .map(|n| {
                CounterSpec::from_name(n)
                    .ok_or_else(|| Error::Parse(format!("unknown counter: {}", n)))
            })
            .collect::<Result<_>>()?,
        None => CounterSpec::ALL.to_vec(),
    };

    let mut counters: Vec<Box<dyn HardwareCounter>> = Vec::with_capacity(specs.len());
    for spec in &specs {
        counters.push(Box::new(PerfCounter::open(*spec, cli.pid)?));
    }

    let mut file = File::create(&cli.out).map_err(|e| Error::ModelLoad {
        path: cli.out.display().to_string(),
        reason: e.to_string(),
    })?;

    write!(file, "sample").map_err(Error::Io)?;
    for spec in &specs {
        write!(file, ",{}", spec.name()).map_err(Error::Io)?;
    }
    writeln!(file).map_err(Error::Io)?;

    // Sample 0 of each counter's stream is its raw first read; every
    // sample after that is current - previous raw reading (spec.md §3),
    // matching the online sampler's numeric semantics.
    let mut prev: Option<Vec<u64>> = None;

    for sample in 0..cli.samples {
        std::thread::sleep(Duration::from_millis(cli.interval_ms));

        write!(file, "{}", sample).map_err(Error::Io)?;
        let mut current = vec![0u64; counters.len()];
        for (i, counter) in counters.iter_mut().enumerate() {
            current[i] = counter.read_raw()?;
            let value = match &prev {
                None => current[i],
                Some(prev) => current[i].wrapping_sub(prev[i]),
            };
            write!(file, ",{}", value).map_err(Error::Io)?;
        }
        writeln!(file).map_err(Error::Io)?;
        prev = Some(current);
    }

    info!(
        "kleb-collect: wrote {} samples for pid {} to {}",
        cli.samples,
        cli.pid,
        cli.out.display()
    );
    Ok(())
}
