//! echo-relay: a concurrent TCP echo/broadcast server
//!
//! Accepts TCP connections and reads raw byte chunks from each. Depending
//! on configuration, each chunk is:
//! - echoed back to the sender (`-e`)
//! - broadcast to every other connected client (`-b`)
//!
//! Every received chunk is also mirrored verbatim to stdout. Data is
//! forwarded as opaque bytes with no framing or encoding assumptions.

mod config;
mod registry;
mod server;

use clap::CommandFactory;
use config::{CliArgs, Config, ConfigError};
use server::Server;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e @ ConfigError::MissingPort) => {
            eprintln!("{e}\n");
            CliArgs::command().print_help()?;
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };

    // Initialize logging; stdout is reserved for mirrored payloads
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::bind(config)?;
        server.run().await
    })
}
