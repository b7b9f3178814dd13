//! Session server: hosts playback sessions for remote clients over a Unix socket.
//!
//! Every session's commands run on one shared scheduler thread; engines report back through
//! callbacks that are turned into commands on the same thread, and events flow to the
//! owning client connection.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use session_server::config::{ServerConfig, ServerSettings};
use session_server::{cli, runtime, simulated::SimulatedEngineFactory};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    let cfg = match args.config.as_deref() {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let settings = ServerSettings::resolve(&cfg, &args)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .init();

    runtime::run_server(settings, Arc::new(SimulatedEngineFactory), true)
}
