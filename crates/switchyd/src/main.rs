//! switchyd entry point.

use clap::Parser;
use log::{error, info};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use switchyd::{DaemonConfig, OrchDaemon};
use switchyd_orch_common::Store;
use switchyd_sad::{SimConfig, SimDriver};
use switchyd_types::MacAddress;

/// Network state reconciliation daemon
#[derive(Parser, Debug)]
#[command(name = "switchyd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Switch MAC address override
    #[arg(short = 'm', long)]
    mac_address: Option<String>,

    /// Batch size for table pops
    #[arg(short = 'b', long, default_value = "128")]
    batch_size: usize,

    /// Record popped tuples to a text log
    #[arg(short = 'r', long)]
    record: bool,

    /// Record log path
    #[arg(long, default_value = "switchyd.rec")]
    record_file: PathBuf,

    /// ACL counter poll interval in seconds
    #[arg(long, default_value = "10")]
    counter_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&args.log_level),
    )
    .init();

    info!("starting switchyd");

    let mut sim_config = SimConfig::default();
    if let Some(mac) = &args.mac_address {
        match mac.parse::<MacAddress>() {
            Ok(mac) => sim_config.mac = mac,
            Err(e) => {
                error!("invalid switch MAC {:?}: {}", mac, e);
                return ExitCode::FAILURE;
            }
        }
    }

    let store = Store::new();
    let driver = Arc::new(SimDriver::new(sim_config));
    let config = DaemonConfig {
        batch_size: args.batch_size,
        counter_interval: Duration::from_secs(args.counter_interval),
        record_path: args.record.then(|| args.record_file.clone()),
        ..DaemonConfig::default()
    };

    let mut daemon = match OrchDaemon::new(store, driver, config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // SIGTERM/SIGINT raise the terminate flag; SIGHUP rotates logs.
    let terminate = Arc::new(AtomicBool::new(false));
    let rotate = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&terminate)) {
            error!("failed to register signal {}: {}", signal, e);
            return ExitCode::FAILURE;
        }
    }
    if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&rotate)) {
        error!("failed to register SIGHUP: {}", e);
        return ExitCode::FAILURE;
    }

    daemon.run(terminate, rotate);
    info!("switchyd stopped");
    ExitCode::SUCCESS
}
