//! BFD daemon entry point
//!
//! Loads the YAML configuration, brings up the listening sockets and the
//! configured peers, logs every session state transition and runs until
//! SIGTERM or Ctrl-C. Exits 0 on clean shutdown, nonzero on a fatal
//! startup error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bfd_core::{Config, Result};
use bfd_server::{AdminApi, BfdServer, PeerSpec, Watcher};

#[derive(Parser, Debug)]
#[command(name = "bfdd")]
#[command(version, about = "Bidirectional Forwarding Detection daemon", long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional listen addresses, host[:port]
    #[arg(short, long)]
    listen: Vec<String>,

    /// Verbose output (-v, -vv for increasing verbosity)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    let server = Arc::new(BfdServer::new());
    let admin = AdminApi::new(Arc::clone(&server));

    for address in config.listen.iter().chain(args.listen.iter()) {
        server.listen(address)?;
    }

    server.serve()?;

    for (ip, peer) in &config.peers {
        let spec = PeerSpec {
            name: peer.name.clone(),
            address: peer.address(ip),
            desired_min_tx: peer.interval,
            required_min_rx: peer.interval,
            detect_multiplier: peer.detection_multiplier,
            is_multi_hop: false,
        };

        match admin.add_peer(&spec).await {
            Ok(uuid) => {
                let watcher = admin.monitor_peer(uuid)?;
                tokio::spawn(log_state_updates(spec.address.clone(), watcher));
            }
            Err(e) => {
                warn!(peer = %spec.address, error = %e, "error adding peer");
            }
        }
    }

    info!("started server");

    wait_for_shutdown().await;

    server.shutdown();
    info!("shutdown server");

    Ok(())
}

/// Log every state transition of one peer, counting its Down events
async fn log_state_updates(address: String, mut watcher: Watcher) {
    let mut down_counter = 0u64;

    while let Some(event) = watcher.recv().await {
        let state = event.local.session_state();

        if state == bfd_core::SessionState::Down {
            down_counter += 1;
        }

        info!(
            peer = %address,
            state = %state,
            diagnostic = %event.local.diagnostic(),
            down_count = down_counter,
            "state change"
        );
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "unable to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
