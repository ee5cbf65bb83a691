//! Per-connection worker task: `READING_LINE` → `HANDLING` → `READING_LINE`,
//! with `TERMINATING` reached on stream close, transport error, an oversize
//! line, or an unrecoverable write error.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::protocol::codec::{format_err, Request};
use crate::protocol::framer::{FramerError, LineFramer};
use crate::server::context::AppContext;
use crate::server::router;
use crate::store::session::ConnectionHandle;

/// Drives one accepted connection for its whole lifetime. Never returns an
/// error: all failure paths end in cleanup, not propagation, since there is
/// no caller left to hand an error to once the socket is gone.
pub async fn handle_connection(stream: TcpStream, ctx: Arc<AppContext>) {
    let peer = stream.peer_addr().ok();
    let conn_id = ctx.next_connection_id();
    let (read_half, write_half) = stream.into_split();
    let handle: ConnectionHandle = Arc::new(AsyncMutex::new(write_half));
    ctx.sessions.register_connection(conn_id, handle.clone()).await;

    tracing::debug!(conn_id, ?peer, "connection accepted");
    ctx.activity_log.record(&format!("connection {conn_id} opened"));

    let mut read_half = read_half;
    let mut framer = LineFramer::new();

    loop {
        let line = match framer.next_line(&mut read_half).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(conn_id, "connection closed by peer");
                break;
            }
            Err(FramerError::LineTooLong) => {
                tracing::warn!(conn_id, "line exceeded maximum length, closing connection");
                break;
            }
            Err(FramerError::Io(e)) => {
                tracing::warn!(conn_id, error = %e, "transport error while reading");
                break;
            }
        };

        let line = String::from_utf8_lossy(&line).into_owned();
        let (response, should_terminate) = match Request::parse(&line) {
            Ok(req) => router::dispatch(&req, conn_id, &handle, &ctx).await,
            Err(_) => (format_err("0", 400, "bad_request"), false),
        };

        let mut guard = handle.lock().await;
        let write_result = guard.write_all(response.as_bytes()).await;
        drop(guard);
        if let Err(e) = write_result {
            tracing::warn!(conn_id, error = %e, "write error, terminating connection");
            break;
        }
        if should_terminate {
            tracing::debug!(conn_id, "handler requested termination");
            break;
        }
    }

    ctx.sessions.remove_by_connection(conn_id).await;
    ctx.activity_log.record(&format!("connection {conn_id} closed"));
}
