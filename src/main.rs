//! jumpgate: an SSH jump server that starts target machines on demand.
//!
//! Clients connect as the `jump` user and open direct-tcpip channels naming
//! a configured target; the backing machine is provisioned lazily, kept
//! while it has activity, and torn down after its linger interval.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use jumpgate::config;
use jumpgate::manager::Manager;
use jumpgate::ssh;

#[derive(Parser, Debug)]
#[command(name = "jumpgate", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Parse the configuration, report problems and exit
    #[arg(long)]
    check: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Report every configuration problem, then only fail on errors.
    let (config, diags) = config::load(&cli.config);
    for diag in diags.iter() {
        eprintln!("{diag}");
    }
    let Some(config) = config else {
        std::process::exit(1);
    };
    if cli.check {
        return;
    }

    let manager = Arc::new(Manager::new(config.providers));

    let listener = match TcpListener::bind(&config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Could not bind to {}: {}", config.listen, err);
            std::process::exit(1);
        }
    };
    info!("Listening on {}", config.listen);

    let server = Arc::new(ssh::Server::new(
        config.host_key,
        config.authorized_key,
        manager.clone(),
    ));
    let mut accept_task = tokio::spawn(ssh::serve(listener, server));

    let mut exit_code = 0;
    tokio::select! {
        _ = shutdown_signal() => {
            accept_task.abort();
            // Only handle one interruption; the next one kills the process.
            tokio::spawn(async {
                shutdown_signal().await;
                std::process::exit(1);
            });
        }
        result = &mut accept_task => {
            exit_code = 1;
            match result {
                Ok(Err(err)) => error!("Could not accept connection: {}", err),
                Ok(Ok(())) => {}
                Err(err) => error!("Connection listener failed: {}", err),
            }
        }
    }

    info!("Stopping all machines");
    manager.stop().await;
    info!("Shutdown complete");
    std::process::exit(exit_code);
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
