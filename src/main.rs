//! An in-memory, single-process key-value server speaking a line-oriented
//! binary request/reply protocol, with optional primary/follower
//! replication.

mod commands;
mod config;
mod connection;
mod context;
mod errors;
mod protocol;
mod replication;
mod server;
mod snapshot;
mod store;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use config::{Args, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let config = ServerConfig::from_args(args)?;

    if let Err(err) = server::run(config).await {
        tracing::error!(error = %err, "server exited with error");
        std::process::exit(1);
    }
    Ok(())
}
