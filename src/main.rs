//! tracedperf: samples perf events into a perfetto trace.
//!
//! Every `--config` file describes one `linux.perf` data source. All of them are started
//! together, run until `--duration` expires or Ctrl-C, and are then stopped and drained before
//! the trace is finalized.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tracedperf::perfetto::TraceFile;
use tracedperf::service::{LocalConnector, ServiceEvent};
use tracedperf::{DataSourceConfig, PerfProducer, ProducerTask};

/// How long the producer gets to connect to the in-process service.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "tracedperf")]
#[command(about = "Sample perf events into a perfetto trace")]
#[command(version)]
struct Command {
    /// Data source config (JSON), may be given multiple times
    #[arg(short, long, required = true)]
    config: Vec<PathBuf>,

    /// Where to write the trace
    #[arg(short, long, default_value = "trace.pb")]
    output: PathBuf,

    /// Seconds to profile for, 0 profiles until Ctrl-C
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Seconds to wait for data sources to drain once stopped
    #[arg(long, default_value = "10")]
    stop_timeout: u64,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn wait_for_registration(events: &Receiver<ServiceEvent>) -> Result<()> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left) {
            Ok(ServiceEvent::DataSourceRegistered(name)) => {
                info!("Producer registered {name}");
                return Ok(());
            }
            Ok(_) => continue,
            Err(_) => bail!("Producer never registered its data source"),
        }
    }
}

/// Waits for the stop of every data source in `pending` to be acknowledged.
fn wait_for_stops(events: &Receiver<ServiceEvent>, mut pending: HashSet<u64>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !pending.is_empty() {
        let left = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(left) {
            Ok(ServiceEvent::DataSourceStopped(ds_id)) => {
                info!("Data source {ds_id} stopped");
                pending.remove(&ds_id);
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                warn!("Gave up waiting for data sources {pending:?} to stop");
                return;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbose);

    let configs = opts
        .config
        .iter()
        .map(|path| DataSourceConfig::from_file(path))
        .collect::<Result<Vec<_>>>()?;

    let trace = TraceFile::create(&opts.output)?;
    let (events_tx, events_rx) = channel();
    let mut producer = PerfProducer::new(Box::new(LocalConnector::new(trace.clone(), events_tx)))?;
    let sender = producer.sender();
    let producer_thread = thread::Builder::new()
        .name("perf-producer".to_string())
        .spawn(move || producer.run())
        .context("Failed to spawn the producer thread")?;

    wait_for_registration(&events_rx)?;

    let mut ds_ids = HashSet::new();
    for (idx, config) in configs.into_iter().enumerate() {
        let ds_id = idx as u64 + 1;
        ds_ids.insert(ds_id);
        sender
            .post(ProducerTask::StartDataSource { ds_id, config })
            .map_err(|_| anyhow!("Producer exited early"))?;
    }

    let (stop_tx, stop_rx) = channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to set the Ctrl-C handler")?;
    if opts.duration > 0 {
        println!("Profiling for {} seconds", opts.duration);
        let _ = stop_rx.recv_timeout(Duration::from_secs(opts.duration));
    } else {
        println!("Profiling, press Ctrl-C to stop");
        let _ = stop_rx.recv();
    }

    for ds_id in ds_ids.iter() {
        let _ = sender.post(ProducerTask::StopDataSource { ds_id: *ds_id });
    }
    wait_for_stops(&events_rx, ds_ids, Duration::from_secs(opts.stop_timeout));

    let _ = sender.post(ProducerTask::Quit);
    producer_thread
        .join()
        .map_err(|_| anyhow!("Producer thread panicked"))?;
    trace.flush()?;
    println!("Trace written to {}", opts.output.display());
    Ok(())
}
