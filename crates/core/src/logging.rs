//! Logging setup
//!
//! Installs a `tracing-subscriber` registry once per process. Console output
//! goes to stderr so stdout stays free for command output; an optional second
//! layer appends plain text to a log file.
//!
//! ## Environment Variables
//!
//! * `PROTOMAN_LOG_FORMAT` - `json` for structured output, anything else for text
//! * `PROTOMAN_LOG` - filter directives (e.g. `protoman_core=debug`)
//! * `RUST_LOG` - fallback filter when `PROTOMAN_LOG` is unset
//! * `PROTOMAN_LOG_FILE` - path of a file to append logs to

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::io;
use tracing_subscriber::{
    fmt, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

static INIT: Once = Once::new();

pub const LOG_FORMAT_ENV: &str = "PROTOMAN_LOG_FORMAT";
pub const LOG_FILTER_ENV: &str = "PROTOMAN_LOG";
pub const LOG_FILE_ENV: &str = "PROTOMAN_LOG_FILE";

/// Output options; unset fields fall back to the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// `text` or `json`
    pub format: Option<String>,
    /// Filter directives, taking precedence over the environment
    pub level: Option<String>,
    /// File to append logs to
    pub file: Option<PathBuf>,
}

impl LogOptions {
    fn effective_format(&self) -> String {
        self.format
            .clone()
            .or_else(|| std::env::var(LOG_FORMAT_ENV).ok())
            .unwrap_or_else(|| "text".to_string())
    }

    fn effective_file(&self) -> Option<PathBuf> {
        self.file
            .clone()
            .or_else(|| std::env::var_os(LOG_FILE_ENV).map(PathBuf::from))
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize logging. Calls after the first one are no-ops.
pub fn init(options: &LogOptions) -> Result<()> {
    let log_file = match options.effective_file() {
        Some(path) => Some(open_log_file(&path)?),
        None => None,
    };
    let format = options.effective_format();
    let level = options.level.clone();

    INIT.call_once(move || {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        let console = match format.as_str() {
            "json" => fmt::layer()
                .json()
                .with_target(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_writer(io::stderr)
                .boxed(),
            _ => fmt::layer()
                .with_target(true)
                .with_span_events(FmtSpan::NONE)
                .with_writer(io::stderr)
                .boxed(),
        };
        layers.push(console);

        if let Some(file) = log_file {
            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            );
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(create_env_filter(level.as_deref()))
            .init();

        tracing::debug!("Logging initialized with format: {}", format);
    });

    Ok(())
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Filter from an explicit directive, then `PROTOMAN_LOG`, then `RUST_LOG`, then `info`
fn create_env_filter(directive: Option<&str>) -> EnvFilter {
    let directive = directive
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_FILTER_ENV).ok());

    match directive {
        Some(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|_| {
            eprintln!("Invalid log filter '{}', using 'info'", directive);
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

pub fn is_initialized() -> bool {
    INIT.is_completed()
}
