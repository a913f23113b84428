//! Command-line argument parsing shared by the server and client binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Turnstile command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "turnstile", about = "Turnstile authenticated connection gateway")]
pub struct CliArgs {
    /// Server bind address (server) or server address to dial (client).
    #[arg(long)]
    pub address: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent connections (server only).
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds a connection may stay unauthenticated (server only).
    #[arg(long)]
    pub handshake_timeout: Option<u64>,

    /// Account identity to present (client only).
    #[arg(long)]
    pub identity: Option<u64>,

    /// License owner to embed in the ticket (client only).
    #[arg(long)]
    pub owner: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.address {
            self.server.bind_address = addr.clone();
            self.client.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
            self.client.server_port = port;
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(secs) = args.handshake_timeout {
            self.server.handshake_timeout_secs = secs;
        }
        if let Some(identity) = args.identity {
            self.client.identity = identity;
        }
        if let Some(owner) = args.owner {
            self.client.owner = Some(owner);
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
