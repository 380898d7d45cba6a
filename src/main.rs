//! tcp-serv binary: serves the echo handler until SIGINT/SIGTERM, then drains.

use std::sync::Arc;
use tcp_serv::config::Config;
use tcp_serv::{EchoHandler, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        idle_timeout_ms = config.idle_timeout.as_millis() as u64,
        byte_limit = config.byte_limit,
        "Starting tcp-serv"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(Server::new(config.server_config()));
    let handler = Arc::new(EchoHandler::new());

    let mut serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.listen_and_serve(handler).await })
    };

    tokio::select! {
        // Only a bind failure ends the accept loop on its own.
        result = &mut serving => return Ok(result??),
        _ = shutdown_signal() => {}
    }

    server.shutdown().await;
    serving.await??;
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
