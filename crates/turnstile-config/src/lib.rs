//! Configuration system for the Turnstile gateway.
//!
//! Provides runtime-configurable settings for the server and client processes
//! that persist to disk as RON files. Supports CLI overrides via clap and
//! forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    ClientConfig, Config, DebugConfig, OwnerMismatchPolicy, ServerConfig, TicketConfig,
    default_config_dir,
};
pub use error::ConfigError;
