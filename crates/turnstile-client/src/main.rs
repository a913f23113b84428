//! Turnstile client: presents an auth ticket and talks to the server.
//!
//! Run with: `cargo run -p turnstile-client -- --identity 76561197960265729`

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use turnstile_config::{CliArgs, Config, default_config_dir};
use turnstile_net::{
    ClientState, FrameConfig, GameClient, Identity, TicketAuthority, TicketIssuer,
};

const MAX_MESSAGES_PER_POLL: usize = 32;

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

    let identity = Identity(config.client.identity);
    let owner = Identity(config.client.effective_owner());
    if !identity.is_valid() {
        return Err("client identity must be non-zero".into());
    }

    let addr = tokio::net::lookup_host((
        config.client.server_address.as_str(),
        config.client.server_port,
    ))
    .await?
    .next()
    .ok_or("server address did not resolve")?;

    let authority = TicketAuthority::from_config(&config.ticket)?;
    let issuer = TicketIssuer::new(authority, identity, owner);
    info!("Connecting to {} as {}", addr, identity);
    let client = Arc::new(GameClient::connect(addr, issuer, FrameConfig::default()).await?);

    let mut poll_loop = {
        let client = Arc::clone(&client);
        let period = Duration::from_millis(config.client.poll_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                client.poll(MAX_MESSAGES_PER_POLL);
                match client.state() {
                    ClientState::Disconnected | ClientState::Rejected => return client.state(),
                    _ => {}
                }
            }
        })
    };

    info!("Type 'quit' to exit, 'msg <message>' to send.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if console_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line == "quit" {
                        info!("'quit' received, shutting down");
                        break;
                    }
                    if let Some(text) = line.strip_prefix("msg ") {
                        if let Err(err) = client.send_text(text) {
                            warn!("Cannot send message: {err}");
                        }
                    } else if !line.is_empty() {
                        warn!("Unknown command '{line}'");
                    }
                }
                Ok(None) | Err(_) => console_open = false,
            },
            ended = &mut poll_loop => {
                match ended {
                    Ok(state) => info!("Connection ended ({state:?})"),
                    Err(err) => warn!("Poll loop stopped: {err}"),
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
        }
    }

    poll_loop.abort();
    client.disconnect();
    info!("Client shut down");
    Ok(())
}
