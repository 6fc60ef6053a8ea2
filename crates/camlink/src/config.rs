//! Camera session configuration.
//!
//! Priority: environment variables > settings file > defaults.

use log::warn;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of thumbnail transfers allowed in the driver at once.
pub const DEFAULT_THUMBNAIL_CONCURRENCY: usize = 2;
/// Default wait for a thumbnail slot before giving up with "busy".
pub const DEFAULT_THUMBNAIL_TIMEOUT_MS: u64 = 1000;
/// Default handshake timeout for wired/explicit endpoints.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
/// Wi-Fi access-point handshakes are slower.
pub const DEFAULT_ACCESS_POINT_TIMEOUT_MS: u64 = 10_000;
/// How long disconnect waits for the scan worker before abandoning it.
pub const DEFAULT_SCAN_JOIN_TIMEOUT_MS: u64 = 5000;

const ENV_DRIVER_PATH: &str = "CAMLINK_DRIVER_PATH";
const ENV_THUMBNAIL_CONCURRENCY: &str = "CAMLINK_THUMBNAIL_CONCURRENCY";
const ENV_THUMBNAIL_TIMEOUT_MS: &str = "CAMLINK_THUMBNAIL_TIMEOUT_MS";
const ENV_CONNECT_TIMEOUT_MS: &str = "CAMLINK_CONNECT_TIMEOUT_MS";
const ENV_AP_TIMEOUT_MS: &str = "CAMLINK_AP_TIMEOUT_MS";
const ENV_SCAN_JOIN_TIMEOUT_MS: &str = "CAMLINK_SCAN_JOIN_TIMEOUT_MS";
const ENV_SERIALIZE_DRIVER_CALLS: &str = "CAMLINK_SERIALIZE_DRIVER_CALLS";

/// User settings as persisted in a JSON file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CameraSettings {
    pub driver_search_path: Option<PathBuf>,
    pub thumbnail_concurrency: Option<usize>,
    pub thumbnail_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub access_point_timeout_ms: Option<u64>,
    pub scan_join_timeout_ms: Option<u64>,
    pub serialize_driver_calls: Option<bool>,
}

impl CameraSettings {
    /// Parses settings JSON.
    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    /// Loads settings from a JSON file.
    /// Returns defaults if the file doesn't exist or can't be parsed.
    pub fn load(path: &Path) -> Self {
        let Ok(contents) = fs::read_to_string(path) else {
            return Self::default();
        };
        match Self::parse(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring unreadable camera settings at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }
}

/// Resolved configuration for a [`crate::CameraService`].
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Where the driver loader looks for camera/port plugins. `None` means the driver's built-in default.
    pub driver_search_path: Option<PathBuf>,
    /// Capacity of the thumbnail concurrency gate (at least 1).
    pub thumbnail_concurrency: usize,
    pub thumbnail_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub access_point_timeout_ms: u64,
    pub scan_join_timeout_ms: u64,
    /// Funnel every driver call through one lock. Needed when the transport is not reentrant.
    pub serialize_driver_calls: bool,
}

impl CameraConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Self {
        Self::from_settings_and_env(None)
    }

    /// Load configuration with priority: env vars > user settings > defaults.
    pub fn from_settings_and_env(settings: Option<CameraSettings>) -> Self {
        Self::from_sources(settings, |key| env::var(key).ok())
    }

    /// Resolves configuration from settings and an arbitrary variable lookup.
    pub fn from_sources(settings: Option<CameraSettings>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let settings = settings.unwrap_or_default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let driver_search_path = lookup(ENV_DRIVER_PATH)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or(settings.driver_search_path);

        let thumbnail_concurrency = parsed(ENV_THUMBNAIL_CONCURRENCY)
            .map(|v| v as usize)
            .or(settings.thumbnail_concurrency)
            .unwrap_or(DEFAULT_THUMBNAIL_CONCURRENCY)
            .max(1);

        let serialize_driver_calls = lookup(ENV_SERIALIZE_DRIVER_CALLS)
            .map(|v| v == "true" || v == "1")
            .or(settings.serialize_driver_calls)
            .unwrap_or(true);

        Self {
            driver_search_path,
            thumbnail_concurrency,
            thumbnail_timeout_ms: parsed(ENV_THUMBNAIL_TIMEOUT_MS)
                .or(settings.thumbnail_timeout_ms)
                .unwrap_or(DEFAULT_THUMBNAIL_TIMEOUT_MS),
            connect_timeout_ms: parsed(ENV_CONNECT_TIMEOUT_MS)
                .or(settings.connect_timeout_ms)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            access_point_timeout_ms: parsed(ENV_AP_TIMEOUT_MS)
                .or(settings.access_point_timeout_ms)
                .unwrap_or(DEFAULT_ACCESS_POINT_TIMEOUT_MS),
            scan_join_timeout_ms: parsed(ENV_SCAN_JOIN_TIMEOUT_MS)
                .or(settings.scan_join_timeout_ms)
                .unwrap_or(DEFAULT_SCAN_JOIN_TIMEOUT_MS),
            serialize_driver_calls,
        }
    }

    pub fn thumbnail_timeout(&self) -> Duration {
        Duration::from_millis(self.thumbnail_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn access_point_timeout(&self) -> Duration {
        Duration::from_millis(self.access_point_timeout_ms)
    }

    pub fn scan_join_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_join_timeout_ms)
    }
}

impl Default for CameraConfig {
    /// Built-in defaults, ignoring the environment.
    fn default() -> Self {
        Self::from_sources(None, |_| None)
    }
}
