//! Turnstile server: admits game clients and authenticates their tickets.
//!
//! Listens on the configured port, runs the gateway poll loop and the
//! callback pump on their own intervals, and shuts down on `quit` or Ctrl-C.
//!
//! Run with: `cargo run -p turnstile-server -- --port 1234`

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use turnstile_config::{CliArgs, Config, default_config_dir};
use turnstile_net::{
    AuthorityValidator, Gateway, GatewayConfig, TcpServerConfig, TcpTransport, TicketAuthority,
};

type ServerGateway = Gateway<TcpTransport, AuthorityValidator>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone() {
        Some(dir) => dir,
        None => default_config_dir()?,
    };
    let mut config = Config::load_or_create(&config_dir)?;
    config.apply_cli_overrides(&args);

    turnstile_log::init_logging(Some(&config));
    info!("Turnstile server starting");

    let authority = TicketAuthority::from_config(&config.ticket)?;
    let tcp_config = TcpServerConfig::from_config(&config.server)?;
    let listener = TcpListener::bind(tcp_config.bind_addr).await?;
    info!(
        "Listening on {} (max {} connections, handshake timeout {}s, owner mismatch {:?})",
        tcp_config.bind_addr,
        config.server.max_connections,
        config.server.handshake_timeout_secs,
        config.server.owner_mismatch,
    );

    let transport = Arc::new(TcpTransport::new(tcp_config));
    let validator = Arc::new(AuthorityValidator::new(authority));
    let gateway = Arc::new(Gateway::new(
        GatewayConfig::from(&config.server),
        Arc::clone(&transport),
        Arc::clone(&validator),
    ));

    let accept_loop = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            if let Err(err) = transport.run_with_listener(listener).await {
                error!("Accept loop failed: {err}");
            }
        })
    };

    let poll_loop = {
        let gateway = Arc::clone(&gateway);
        let period = Duration::from_millis(config.server.poll_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(err) = gateway.poll() {
                    warn!("Receive failed: {err}");
                }
            }
        })
    };

    let callback_loop = {
        let gateway = Arc::clone(&gateway);
        let period = Duration::from_millis(config.server.callback_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                gateway.run_callbacks(&[&*transport, &*validator]);
            }
        })
    };

    info!("Type 'quit' to stop, 'say <message>' to broadcast.");
    run_console(&gateway).await;

    poll_loop.abort();
    callback_loop.abort();
    gateway.shutdown();
    let _ = accept_loop.await;

    info!("Server shut down");
    Ok(())
}

/// Read operator commands until `quit`, end of input plus Ctrl-C, or Ctrl-C.
async fn run_console(gateway: &ServerGateway) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line == "quit" {
                        info!("'quit' received, shutting down");
                        return;
                    }
                    if let Some(text) = line.strip_prefix("say ") {
                        let sent = gateway.broadcast(text);
                        info!("Broadcast to {sent} validated connections");
                    } else if !line.is_empty() {
                        warn!("Unknown command '{line}'");
                    }
                }
                Ok(None) | Err(_) => {
                    // No console attached; only a signal can stop the server.
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl-C received, shutting down");
                    return;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                return;
            }
        }
    }
}
