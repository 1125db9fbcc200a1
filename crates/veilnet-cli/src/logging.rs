//! Logging setup from the `logging` configuration section.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use veilnet_core::config::LoggingSection;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level when set.
///
/// # Errors
///
/// A message destined for stderr when the log file cannot be opened.
pub fn init(section: &LoggingSection) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(section.level.clone()));

    let json = section.format == "json";

    if section.file.is_empty() {
        if json {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        return Ok(());
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&section.file)
        .map_err(|e| format!("cannot open log file {}: {e}", section.file))?;
    let writer = Arc::new(file);

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
    }

    Ok(())
}
