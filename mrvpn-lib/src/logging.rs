use std::fs::OpenOptions;
use std::path::PathBuf;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info";
const ENV_VAR_LOG_FILE: &str = "MRVPN_LOG_FILE";
#[cfg(windows)]
const DEFAULT_LOG_FILE: &str = r"C:\ProgramData\MRVPN\mrvpn.log";
#[cfg(not(windows))]
const DEFAULT_LOG_FILE: &str = "/var/log/mrvpn.log";

/// Console logging for interactive runs; filter from `RUST_LOG`.
pub fn init_interactive() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// File logging for service runs, where no console exists. Returns the
/// log path in use.
pub fn init_service() -> PathBuf {
    let log_path = log_path();
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .unwrap_or_else(|e| panic!("failed to open log file {}: {e}", log_path.display()));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
        .with(filter)
        .init();
    log_path
}

fn log_path() -> PathBuf {
    match std::env::var(ENV_VAR_LOG_FILE) {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from(DEFAULT_LOG_FILE),
    }
}
