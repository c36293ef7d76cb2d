//! # Observability
//!
//! Centralized logging initialization for stream-queue binaries.
//!
//! Library code only uses `tracing` macros with structured fields. A binary
//! calls [`init`] or [`init_with_config`] once at startup and decides where
//! the events go:
//!
//! - a JSONL file, one object per event, appended and flushed per line
//! - stderr, in compact human-readable form
//!
//! Both outputs honor `RUST_LOG`; without it the configured default level
//! applies.
//!
//! ## Usage
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "stream-queue".into(),
//!         default_level: "debug".into(),
//!         also_stderr: true,
//!         ..Default::default()
//!     });
//!
//!     tracing::info!("ready");
//! }
//! ```
//!
//! Failures are flagged with `error!(severity = "critical", ...)`; the JSONL
//! output records those events with level `CRITICAL`.

mod json_layer;
mod writer;

pub use json_layer::{JsonLayer, LogEntry};
pub use writer::{default_log_path, LogFileWriter};

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every JSONL line.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Write JSONL to a file.
    pub file_output: bool,

    /// Custom log file path. Defaults to [`default_log_path`].
    pub log_path: Option<PathBuf>,

    /// Also emit logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            file_output: true,
            log_path: None,
            also_stderr: false,
        }
    }
}

impl LogConfig {
    /// The file JSONL lines go to, if file output is on.
    pub fn resolved_log_path(&self) -> Option<PathBuf> {
        self.file_output.then(|| {
            self.log_path
                .clone()
                .unwrap_or_else(|| default_log_path(&self.service_name))
        })
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }
}

/// Initialize logging with default settings for `service_name`.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// Only the first call in a process installs a subscriber. When the log file
/// cannot be opened, logging continues on stderr.
pub fn init_with_config(config: LogConfig) {
    let log_path = config.resolved_log_path();

    let (file_layer, file_error) = match &log_path {
        Some(path) => match LogFileWriter::open(path) {
            Ok(writer) => (
                Some(JsonLayer::new(config.service_name.clone(), writer).with_filter(config.env_filter())),
                None,
            ),
            Err(e) => (None, Some(e)),
        },
        None => (None, None),
    };

    let stderr_layer = (config.also_stderr || file_layer.is_none()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(io::stderr)
            .with_filter(config.env_filter())
    });

    let installed = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if !installed {
        return;
    }

    match (file_error, &log_path) {
        (Some(e), Some(path)) => tracing::warn!(
            log_path = %path.display(),
            error = %e,
            "Failed to open log file, logging to stderr only"
        ),
        (None, Some(path)) => tracing::debug!(
            log_path = %path.display(),
            service = %config.service_name,
            "observability initialized"
        ),
        _ => {}
    }
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

pub use tracing::Level;
