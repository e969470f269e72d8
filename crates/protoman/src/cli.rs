use crate::commands::{
    credentials::{execute_credentials, CredentialsArgs},
    down::execute_down,
    logs::{execute_logs, LogsArgs},
    status::{execute_status, StatusArgs},
    up::{execute_up, UpArgs},
    ServiceContext,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use protoman_core::config::Config;
use protoman_core::logging::{self, LogOptions, LOG_FILTER_ENV};
use std::io::IsTerminal;
use std::path::PathBuf;

/// Log format options
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Run a local learning management service in a container
#[derive(Debug, Parser)]
#[command(name = "protoman", version, about, long_about = None)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via PROTOMAN_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level (overrides PROTOMAN_LOG and RUST_LOG)
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Append logs to this file as well (can be set via PROTOMAN_LOG_FILE env var)
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Directory holding the container handle, credentials and settings
    #[arg(long, global = true, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Image to run instead of the configured one
    #[arg(long, global = true, value_name = "NAME")]
    pub image: Option<String>,

    /// Path to the container runtime executable (skips discovery)
    #[arg(long, global = true, value_name = "PATH")]
    pub runtime_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the service, pulling and creating the container when needed
    Up {
        /// Exit once the service is ready and leave it running
        #[arg(long)]
        detach: bool,

        /// Print the admin password in clear
        #[arg(long)]
        show_secret: bool,
    },
    /// Stop the service container
    Down,
    /// Report runtime, container and readiness status
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the stored admin credentials
    Credentials {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,

        /// Print the admin password in clear
        #[arg(long)]
        show_secret: bool,
    },
    /// Print the service container's logs
    Logs {
        /// Only logs since this RFC 3339 timestamp (e.g. 2024-05-01T12:00:00Z)
        #[arg(long, value_name = "TIMESTAMP")]
        since: Option<String>,

        /// Do not mask the admin password in the output
        #[arg(long)]
        show_secret: bool,
    },
}

impl Cli {
    fn log_options(&self) -> LogOptions {
        let format = self.log_format.map(|f| match f {
            LogFormat::Text => "text".to_string(),
            LogFormat::Json => "json".to_string(),
        });

        // Progress bars and log lines share stderr; keep interactive text
        // sessions quiet unless a level was asked for
        let json_format = matches!(self.log_format, Some(LogFormat::Json));
        let env_filter_set =
            std::env::var_os(LOG_FILTER_ENV).is_some() || std::env::var_os("RUST_LOG").is_some();
        let level = match self.log_level {
            Some(level) => Some(level.as_str()),
            None if !env_filter_set && !json_format && std::io::stderr().is_terminal() => {
                Some("warn")
            }
            None => None,
        };

        LogOptions {
            format,
            level: level.map(|l| format!("protoman={},protoman_core={}", l, l)),
            file: self.log_file.clone(),
        }
    }

    pub async fn dispatch(self) -> Result<()> {
        logging::init(&self.log_options())?;
        tracing::debug!("CLI initialized: {:?}", self.command);

        let config = Config::load(self.data_dir.clone(), self.image.clone())
            .context("Failed to load configuration")?;
        let ctx = ServiceContext::new(config, self.runtime_path.clone());

        match self.command {
            Commands::Up {
                detach,
                show_secret,
            } => {
                execute_up(
                    &ctx,
                    UpArgs {
                        detach,
                        show_secret,
                    },
                )
                .await
            }
            Commands::Down => execute_down(&ctx).await,
            Commands::Status { json } => execute_status(&ctx, StatusArgs { json }).await,
            Commands::Credentials { json, show_secret } => {
                execute_credentials(&ctx, CredentialsArgs { json, show_secret })
            }
            Commands::Logs { since, show_secret } => {
                execute_logs(&ctx, LogsArgs { since, show_secret }).await
            }
        }
    }
}
