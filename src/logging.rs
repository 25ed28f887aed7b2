//! Tracing subscriber setup.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Keeps the file writer flushing. Hold it until the process exits.
#[must_use]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Filter directives: `RUST_LOG` wins, then `-v`, then the configured level.
fn directives(level: &str, verbose: bool, rust_log: Option<String>) -> String {
    match rust_log.filter(|v| !v.trim().is_empty()) {
        Some(env) => env,
        None if verbose => "phaserun=debug".to_string(),
        None => format!("phaserun={level}"),
    }
}

/// Installs the global subscriber: console on stderr, plus a daily rolling
/// JSON file when `[logging].file` is set.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<LogGuard> {
    let directives = directives(&config.level, verbose, std::env::var("RUST_LOG").ok());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter '{directives}'"))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match config.format {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(ChronoUtc::rfc_3339())
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let mut guard = None;
    if let Some(file) = config.file.as_deref() {
        let path = Path::new(file);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let name = path
            .file_name()
            .with_context(|| format!("Log file '{file}' has no file name"))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

        let (writer, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
        layers.push(
            fmt::layer()
                .json()
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _file: guard })
}
