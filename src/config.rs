//! Startup configuration: CLI args (via `clap`'s derive API) layered over
//! defaults.

use std::path::PathBuf;

use clap::Parser;

const DEFAULT_PORT: u16 = 8888;
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;

/// `<binary> [port] [session_timeout_seconds]`, both optional.
#[derive(Parser, Debug)]
#[command(name = "chatserver", about = "Multi-user TCP chat service")]
struct Cli {
    /// TCP port to listen on.
    port: Option<u16>,

    /// Idle session timeout, in seconds. `0` or absent uses the default.
    session_timeout_secs: Option<u64>,

    /// Directory for persisted stores; created on startup if absent.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

/// Resolved, immutable startup configuration shared by the listener and
/// every store.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub session_timeout_secs: u64,
    pub data_dir: PathBuf,
}

impl ServerConfig {
    /// Parses `std::env::args()`.
    pub fn from_args() -> Self {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Self {
        let port = cli.port.unwrap_or(DEFAULT_PORT);
        let session_timeout_secs = match cli.session_timeout_secs {
            Some(0) | None => DEFAULT_SESSION_TIMEOUT_SECS,
            Some(secs) => secs,
        };
        Self {
            port,
            session_timeout_secs,
            data_dir: cli.data_dir,
        }
    }
}
