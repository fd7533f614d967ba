//! Demo server: `millrace <echo|chat|framed> [--config PATH] [--port N] [--threads N]`.
//!
//! Without `--config` the server reads `<protocol>_server.json` next to the executable and
//! falls back to the defaults when that file is missing or malformed.

use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use millrace::{
    protocols::{self, Protocol},
    Server, ServerConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Send every received chunk back
    Echo,
    /// Line-based group chat
    Chat,
    /// Echo of 4-digit length-prefixed messages
    Framed,
}

impl From<Mode> for Protocol {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Echo => Protocol::Echo,
            Mode::Chat => Protocol::Chat,
            Mode::Framed => Protocol::Framed,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "millrace", version, about = "Multi-threaded reactor TCP server")]
struct Cli {
    /// Protocol served on every connection
    #[arg(value_enum)]
    protocol: Mode,

    /// JSON config file with `port` and `num_threads`
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Overrides the configured worker count
    #[arg(short, long)]
    threads: Option<usize>,
}

fn default_config_path(protocol: Protocol) -> PathBuf {
    let dir = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(protocol.config_file_name())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();

    let protocol = Protocol::from(cli.protocol);
    let path = cli
        .config
        .unwrap_or_else(|| default_config_path(protocol));
    let mut config = ServerConfig::load_or_default(&path);
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(threads) = cli.threads {
        config.num_threads = threads;
    }

    let server = Server::bind(config).with_context(|| format!("starting {protocol} server"))?;
    server
        .run(protocols::factory(protocol))
        .with_context(|| format!("{protocol} server stopped"))
}
