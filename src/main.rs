use std::sync::Arc;

use chatserver::config::ServerConfig;
use chatserver::server::{self, AppContext};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "chatserver starting");

    let config = ServerConfig::from_args();
    let ctx = match AppContext::new(config.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("FATAL: failed to initialize data directory: {e}");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: failed to bind port {}: {e}", config.port);
            std::process::exit(1);
        }
    };
    info!(port = config.port, session_timeout_secs = config.session_timeout_secs, "listening");

    server::serve(listener, Arc::clone(&ctx), shutdown_signal()).await;
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
