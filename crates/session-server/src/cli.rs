use std::path::PathBuf;

use clap::Parser;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "session-server", version = VERSION)]
pub struct Args {
    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Unix socket to listen on (overrides config)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Maximum number of concurrent sessions (overrides config)
    #[arg(long)]
    pub max_sessions: Option<usize>,
}
