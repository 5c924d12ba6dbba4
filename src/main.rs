use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use rocedada::cli::RawArgs;
use rocedada::config::{Mode, ReceiveParams, L2L3L4_HEADER_BYTES};
use rocedada::engine;
use rocedada::header::HeaderRecord;
use rocedada::ring::shm::ShmRing;
use rocedada::verbs::real::RealNic;
use tracing::{error, info};

fn main() {
    let args = RawArgs::parse();
    let debug = args.debug;

    let filter = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| filter.to_string()),
        ))
        .init();

    let params = match ReceiveParams::try_from(args) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let nic = match RealNic::open(params.device_index) {
        Ok(n) => Box::new(n),
        Err(e) => {
            error!(error = %e, "failed to open NIC device");
            std::process::exit(1);
        }
    };

    let ring = Box::new(ShmRing::new());

    let header = if params.mode == Mode::Receive {
        Some(HeaderRecord::now(
            1,
            L2L3L4_HEADER_BYTES as i32,
            (params.pkt_size - L2L3L4_HEADER_BYTES) as i32,
            1,
            0.0,
            1,
            8,
            0,
            params.file_bytes,
        ))
    } else {
        None
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_signal_handlers(shutdown.clone()) {
        error!(error = %e, "failed to install signal handlers");
        std::process::exit(1);
    }

    info!(mode = ?params.mode, device = params.device_index, "starting capture engine");

    let mut handle = match engine::start(nic, ring, params, header) {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "engine failed to start");
            std::process::exit(1);
        }
    };

    while handle.is_running() && !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let report = handle.stop();
    match report.outcome {
        engine::EngineOutcome::Cancelled => {
            info!(
                packets_captured = report.packets_captured,
                blocks_published = report.blocks_published,
                "shutdown complete"
            );
            std::process::exit(0);
        }
        engine::EngineOutcome::Fatal(e) => {
            error!(error = %e, "capture engine exited with a fatal error");
            std::process::exit(1);
        }
    }
}

fn install_signal_handlers(shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, shutdown.clone())?;
    }
    Ok(())
}
