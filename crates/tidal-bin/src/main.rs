//! Tidal entrypoint: a self-contained swap demo.
//!
//! Runs a small forward/backward model against a constrained in-process
//! device pool. Iteration 1 profiles and pays with emergency swaps;
//! iteration 2 onward replays the scheduler's decision. Useful both as a
//! smoke test and as a reference for embedding the session API.

mod demo;

use anyhow::{Context as _, Result};
use clap::Parser;
use core_config::load_from;
use core_session::Frontend;
use demo::{DemoMemoryManager, DemoModel};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "tidal", version, about = "Tidal memory-swapping demo")]
struct Args {
    /// Device memory capacity in bytes.
    #[arg(long, default_value_t = 2048)]
    device_size: usize,

    /// Per-operator tensor size in bytes.
    #[arg(long, default_value_t = 1024)]
    tensor_size: usize,

    /// Training iterations to run (the first one profiles).
    #[arg(long, default_value_t = 3)]
    iterations: u32,

    /// Optional configuration file path (overrides discovery of
    /// `tidal.toml`).
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Optional log file; stderr when omitted.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn configure_logging(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let filename = path
                .file_name()
                .context("log file path has no file name")?;
            let appender = tracing_appender::rolling::never(directory, filename);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = configure_logging(args.log_file.as_ref())?;

    let context = load_from(args.config.clone()).context("loading context")?;
    info!(
        target: "runtime",
        device_size = args.device_size,
        tensor_size = args.tensor_size,
        iterations = args.iterations,
        "startup"
    );

    let manager = Arc::new(DemoMemoryManager::new(args.device_size));
    let frontend = Frontend::new(context).context("constructing frontend")?;
    frontend
        .set_memory_manager(manager.clone())
        .context("attaching memory manager")?;
    frontend.init().context("initializing frontend")?;

    let model = DemoModel::new(args.tensor_size);
    model.register(&frontend)?;
    frontend.start()?;

    let session = frontend.session()?;
    session.set_callback(
        core_session::CallbackStage::PostSwapOut,
        Box::new(|tensor, _| info!(target: "demo", tensor, "tensor left the device")),
    );
    session.set_callback(
        core_session::CallbackStage::PostSwapIn,
        Box::new(|tensor, address| info!(target: "demo", tensor, address, "tensor returned")),
    );
    for iteration in 1..=args.iterations {
        let traffic_before = manager.swap_traffic();
        model.execute(session)?;
        info!(
            target: "runtime",
            iteration,
            swap_bytes = manager.swap_traffic() - traffic_before,
            device_in_use = manager.device_in_use(),
            "iteration complete"
        );
    }

    if let Some(bundle) = frontend.schedule_events() {
        info!(
            target: "runtime",
            forward_events = bundle.forward.len(),
            backward_events = bundle.backward.len(),
            layers = bundle.memory_map.layers().len(),
            "final schedule"
        );
    }

    frontend.terminate()?;
    info!(target: "runtime", "shutdown");
    Ok(())
}
