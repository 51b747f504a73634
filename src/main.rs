#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # wsterm
//!
//! Interactive client for a WebSocket-served remote shell.
//!
//! ```text
//! wsterm [connect] [--config <path>] [--url <ws-url>] [--api-key <key>]
//!                  [--access-token <token>] [--max-attempts <n>]
//!                  [--no-resume] [--command <cmd>]
//! wsterm forget [--config <path>] [--url <ws-url>]
//! ```
//!
//! Press `Ctrl-]` to detach. Logs go to `[logging] file` when set, otherwise
//! to stderr; `RUST_LOG` overrides the configured level.

use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use wsterm::config::Config;
use wsterm::{client, Error, Result};

/// Terminal client for WebSocket remote shells.
#[derive(Parser)]
#[command(name = "wsterm", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    connect: ConnectArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive session (default when no subcommand given).
    Connect(ConnectArgs),
    /// Forget the persisted session id for a server.
    Forget {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Server URL (ws:// or wss://).
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Args)]
struct ConnectArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Server URL (ws:// or wss://).
    #[arg(long)]
    url: Option<String>,
    /// API key sent in the auth payload.
    #[arg(long)]
    api_key: Option<String>,
    /// Access token sent in the auth payload.
    #[arg(long)]
    access_token: Option<String>,
    /// Give up after this many consecutive failed attempts.
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Do not persist or resume the server session id.
    #[arg(long)]
    no_resume: bool,
    /// Command to type once the shell prompt appears.
    #[arg(long = "command", value_name = "CMD")]
    initial_command: Option<String>,
}

impl ConnectArgs {
    fn apply(self, config: &mut Config) {
        if let Some(url) = self.url {
            config.server.url = Some(url);
        }
        if let Some(key) = self.api_key {
            config.auth.api_key = Some(key);
        }
        if let Some(token) = self.access_token {
            config.auth.access_token = Some(token);
        }
        if let Some(n) = self.max_attempts {
            config.reconnect.max_attempts = n;
        }
        if self.no_resume {
            config.session.resume = false;
        }
        if let Some(command) = self.initial_command {
            config.session.initial_command = Some(command);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Some(Commands::Forget { config, url }) => run_forget(config.as_deref(), url),
        Some(Commands::Connect(args)) => run_connect(args).await,
        None => run_connect(cli.connect).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wsterm: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_connect(args: ConnectArgs) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    init_tracing(&config)?;
    info!("wsterm v{} starting", env!("CARGO_PKG_VERSION"));
    client::run(config).await
}

fn run_forget(config_path: Option<&str>, url: Option<String>) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if url.is_some() {
        config.server.url = url;
    }
    init_tracing(&config)?;
    if client::forget(&config)? {
        println!("Forgot session for {}", config.server_url()?);
    } else {
        println!("No saved session for {}", config.server_url()?);
    }
    Ok(())
}

/// stdout belongs to the remote shell, so logs go to a file or stderr.
fn init_tracing(config: &Config) -> Result<()> {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    let builder = tracing_subscriber::fmt().with_env_filter(log_filter);
    match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| Error::LogFile {
                    path: path.clone(),
                    source,
                })?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}
