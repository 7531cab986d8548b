//! ghostknockd — the passive knock daemon.
//!
//! Loads and validates the YAML config, starts the capture thread and the
//! pipeline, and tears both down on SIGINT/SIGTERM. The advertised port is
//! never bound; see the listener module.

use clap::Parser;
use ghostknock::config::Config;
use ghostknock::daemon::{init_logging, PidFile};
use ghostknock::listener;
use ghostknock::server::Server;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ghostknockd", version, about = "GhostKnock single-packet authorization daemon")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(short = 't', long = "test-config")]
    test_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ghostknockd: invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    if args.test_config {
        println!(
            "configuration OK: {} user(s), {} action(s)",
            config.users.len(),
            config.actions.len()
        );
        return ExitCode::SUCCESS;
    }

    if let Err(err) = init_logging(&config.logging) {
        eprintln!("ghostknockd: {err}");
        return ExitCode::FAILURE;
    }

    info!(version = VERSION, "starting ghostknockd");
    info!(
        users = config.users.len(),
        actions = config.actions.len(),
        interface = %config.listener.interface,
        port = config.listener.port,
        "configuration loaded"
    );
    for user in &config.users {
        debug!(
            user = %user.name,
            key = %hex::encode(&user.public_key.to_bytes()[..8]),
            actions = user.allowed_actions.len(),
            "authorized user"
        );
    }

    let _pid_file = match &config.daemon.pid_file {
        Some(path) => match PidFile::write(path) {
            Ok(pid_file) => Some(pid_file),
            Err(err) => {
                error!(error = %err, "failed to write PID file");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let cancel = CancellationToken::new();

    let (packets, capture_thread) = match listener::spawn(
        &config.listener.interface,
        config.listener.port,
        config.listener.listen_ip,
        cancel.clone(),
    ) {
        Ok(started) => started,
        Err(err) => {
            error!(error = %err, "failed to start capture");
            return ExitCode::FAILURE;
        }
    };

    // SIGINT or SIGTERM cancels the token; the listener drops its handle
    // and the channel, and the pipeline drains until the channel closes.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let server = Arc::new(Server::new(Arc::new(config)));
    server.run(packets, cancel).await;

    if capture_thread.join().is_err() {
        error!("capture thread panicked");
    }
    info!("ghostknockd stopped");
    ExitCode::SUCCESS
}
