//! File-based tracing setup

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

const DEFAULT_LEVEL: &str = "info";

/// Filter directive for this crate at the configured level
fn filter_directive(config: &Config) -> String {
    let level = config.log_level.as_deref().unwrap_or(DEFAULT_LEVEL);
    format!("layerstore_core={}", level)
}

/// Send this crate's logs to `config.log_path()`
///
/// The file is appended to. If a global subscriber is already installed it is
/// left in place. Returns the log file path.
pub fn init(config: &Config) -> Result<PathBuf> {
    let log_path = config.log_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {:?}", log_path))?;

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter_directive(config)))
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(log_file))
        .try_init();

    info!("Logging initialized to {:?}", log_path);
    Ok(log_path)
}
