//! Logger bootstrap and runtime level control.
//!
//! The crate only ever talks to the `log` facade. Hosts that already install a logger can skip
//! [`init_logging`]; standalone tools and tests call it once to get `RUST_LOG`-driven output.

use std::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs `env_logger` (respects `RUST_LOG`, default: info).
///
/// Returns `false` if a logger was already installed, either by an earlier call or by the host.
pub fn init_logging() -> bool {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return false;
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init()
        .is_ok()
}

/// Maps a level name to a filter. Unknown names fall back to info.
pub fn parse_level(level: &str) -> log::LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Changes the global log level at runtime (for example when a verbose-logging toggle flips).
pub fn set_log_level(level: &str) {
    let filter = parse_level(level);
    log::set_max_level(filter);
    log::info!("Log level changed to {filter}");
}
