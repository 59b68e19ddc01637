//! Real-time watch-party coordination service.
//!
//! Holds per-room playback state in memory, arbitrates play/pause/seek
//! between clients behind an epoch-tagged seek barrier, and nudges each
//! client's local playback rate to correct for drift (§4.7).

mod clock;
mod config;
mod drift;
mod extractor;
mod handlers;
mod rate_limiter;
mod room;
mod room_manager;
mod startup;
mod state;
mod user;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub(crate) const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "watch-party-server", version = VERSION)]
pub(crate) struct Args {
    /// HTTP bind address, e.g. 0.0.0.0:3311 (overrides PORT/BIND/config file)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Base URL of the video metadata extractor (overrides API_URL/config file)
    #[arg(long)]
    api_url: Option<String>,

    /// Optional server config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,actix_web=info,watch_party_server=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = VERSION, bind = ?args.bind, config = ?args.config, "watch-party-server starting");

    startup::run(args.bind, args.api_url, args.config).await
}
