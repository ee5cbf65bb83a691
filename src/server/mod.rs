//! The accept loop, per-connection worker, and verb router.

pub mod context;
pub mod router;
pub mod worker;

pub use context::AppContext;

use std::sync::Arc;

use tokio::net::TcpListener;

/// Accepts connections until `shutdown` resolves, spawning one worker task
/// per connection. Never returns an error: a per-accept failure is logged
/// and the loop continues, since one bad `accept()` must not take the whole
/// listener down.
pub async fn serve(listener: TcpListener, ctx: Arc<AppContext>, shutdown: impl std::future::Future<Output = ()>) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::info!(%addr, "accepted connection");
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            worker::handle_connection(stream, ctx).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received, no longer accepting connections");
                break;
            }
        }
    }
}
