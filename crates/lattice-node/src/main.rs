use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use lattice_core::NodeAddr;
use lattice_node::service::ServiceDeps;
use lattice_node::testing::{TestTapFactory, UpStack, mock_engine};
use lattice_node::{ServiceConfig, events, supervisor};

#[derive(Parser)]
#[command(name = "lattice-node", about = "Overlay network node service")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/lattice/config.toml")]
    config: PathBuf,
}

/// Collaborators for a stand-alone run: the in-memory engine, tap
/// factory, and stack probe shipped in [`lattice_node::testing`].
/// Deployments that link a real overlay protocol engine replace this
/// constructor.
fn standalone_deps() -> ServiceDeps {
    let (engine, _state) = mock_engine(NodeAddr::new(rand::random::<u64>()));
    ServiceDeps {
        engine,
        taps: Arc::new(TestTapFactory::new()),
        stack: Arc::new(UpStack::new()),
        mapper: None,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        lattice_node::logging::init_json();
    } else {
        lattice_node::logging::init();
    }

    let config = match ServiceConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", cli.config.display());
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Spawn SIGINT handler
    let sigint_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received SIGINT, shutting down");
        let _ = sigint_tx.send(true);
    });

    // Spawn SIGTERM handler (Docker sends SIGTERM on `docker stop`)
    #[cfg(unix)]
    {
        let sigterm_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            sigterm.recv().await;
            tracing::info!("received SIGTERM, shutting down");
            let _ = sigterm_tx.send(true);
        });
    }

    // Drain service events into the log
    let (sink, mut events_rx) = events::channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            tracing::info!(event = event.code.name(), "service event");
        }
    });

    tracing::warn!(
        "no overlay protocol engine is linked into this binary; running with in-memory collaborators"
    );

    if let Err(e) = supervisor::run_supervised(config, standalone_deps, sink, shutdown_rx).await {
        tracing::error!("failed to start service: {e}");
        std::process::exit(1);
    }
}
