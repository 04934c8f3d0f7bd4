//! Tracing setup: console output plus an error-only log file.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Install the global subscriber.
///
/// Console verbosity comes from `RUST_LOG` when set, otherwise from
/// `default_level`.  Every ERROR event is also appended to `error_log`.
pub fn init(default_level: &str, error_log: &Path) -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.to_ascii_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(error_log)
        .with_context(|| format!("Cannot open error log {}", error_log.display()))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(console_filter))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(LevelFilter::ERROR),
        )
        .try_init()
        .context("Cannot install tracing subscriber")?;

    Ok(())
}
