//! Structured logging for debugging conductor.
//!
//! The engine logs through `tracing` macros with structured fields. The
//! binary installs a subscriber that writes to `~/.conductor/conductor.log`.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent operations from completing
//! - WARN: Unexpected conditions that are recoverable (dropped edges, retries)
//! - INFO: Plan creation, dispatch batches, task outcomes
//! - DEBUG: Discovery scoring, decomposition output, agent invocations
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `RUST_LOG` overrides the level when set.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let Some(path) = log_path() else {
        return;
    };
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    // Truncate file on startup
    let Ok(file) = File::create(&path) else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_env_filter(filter(debug_enabled))
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Location of the log file.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".conductor").join("conductor.log"))
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_level(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level(debug).into())
        .from_env_lossy()
}
