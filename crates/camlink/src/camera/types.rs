//! Value types handed to callers. All serialize as camelCase JSON.

use serde::Serialize;

/// How a camera is attached, derived from its endpoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionType {
    #[serde(rename = "WiFi-AP")]
    WifiAccessPoint,
    #[serde(rename = "USB")]
    Usb,
    Unknown,
}

impl ConnectionType {
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.starts_with("ptpip:") {
            Self::WifiAccessPoint
        } else if lower.starts_with("usb:") {
            Self::Usb
        } else {
            Self::Unknown
        }
    }

    /// Longer description used in connection status.
    pub fn description(self) -> &'static str {
        match self {
            Self::WifiAccessPoint => "WiFi-AP (PTP/IP)",
            Self::Usb => "USB",
            Self::Unknown => "Unknown",
        }
    }
}

/// A camera found by autodetection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDeviceInfo {
    pub model: String,
    pub path: String,
    /// "model @ path"
    pub display_name: String,
    pub connection_type: ConnectionType,
}

/// One media file on the device. Equality and hashing use (folder, filename) only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub folder: String,
    pub filename: String,
    /// Byte size, when the driver reported it. Listing alone doesn't.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl FileDescriptor {
    pub fn new(folder: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            filename: filename.into(),
            size: None,
        }
    }
}

impl PartialEq for FileDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.folder == other.folder && self.filename == other.filename
    }
}

impl Eq for FileDescriptor {}

impl std::hash::Hash for FileDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.folder.hash(state);
        self.filename.hash(state);
    }
}

/// Lifecycle of the catalog scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanState {
    Idle = 0,
    Scanning = 1,
    Cancelled = 2,
    Complete = 3,
    Failed = 4,
}

impl From<u8> for ScanState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Scanning,
            2 => Self::Cancelled,
            3 => Self::Complete,
            4 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// Instantaneous scan progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub current: u64,
    pub total: u64,
    /// The catalog cache holds a complete listing.
    pub cached: bool,
    pub scanning: bool,
    pub state: ScanState,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl From<u8> for SessionState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Disconnected,
        }
    }
}

/// Connection details for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_connected: bool,
    /// Connected and no disconnect in progress.
    pub is_ready: bool,
    pub camera_model: Option<String>,
    pub port_path: Option<String>,
    pub connection_type: ConnectionType,
    /// How long the last successful connect took.
    pub connection_time_ms: Option<u64>,
    /// RFC 3339 timestamp of the last successful connect.
    pub connected_at: Option<String>,
    pub last_error: Option<String>,
}

/// Byte progress of one full-resolution download.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub file_name: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// 0.0 to 1.0. Zero while the total is unknown.
    pub fraction: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_connection_type_from_path() {
        assert_eq!(
            ConnectionType::from_path("ptpip:192.168.1.1:15740"),
            ConnectionType::WifiAccessPoint
        );
        assert_eq!(ConnectionType::from_path("usb:001,004"), ConnectionType::Usb);
        assert_eq!(ConnectionType::from_path("disk:/mnt/card"), ConnectionType::Unknown);
    }

    #[test]
    fn test_connection_type_serializes_like_labels() {
        assert_eq!(
            serde_json::to_value(ConnectionType::WifiAccessPoint).unwrap(),
            "WiFi-AP"
        );
        assert_eq!(serde_json::to_value(ConnectionType::Usb).unwrap(), "USB");
    }

    #[test]
    fn test_file_descriptor_equality_ignores_size() {
        let mut a = FileDescriptor::new("/DCIM/100NIKON", "DSC_0001.NEF");
        let b = FileDescriptor::new("/DCIM/100NIKON", "DSC_0001.NEF");
        a.size = Some(42);
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_file_descriptor_json_omits_unknown_size() {
        let json = serde_json::to_value(FileDescriptor::new("/DCIM", "A.JPG")).unwrap();
        assert_eq!(json, serde_json::json!({"folder": "/DCIM", "filename": "A.JPG"}));
    }

    #[test]
    fn test_state_round_trip_through_u8() {
        for state in [
            ScanState::Idle,
            ScanState::Scanning,
            ScanState::Cancelled,
            ScanState::Complete,
            ScanState::Failed,
        ] {
            assert_eq!(ScanState::from(state as u8), state);
        }
        assert_eq!(SessionState::from(SessionState::Disconnecting as u8), SessionState::Disconnecting);
        assert_eq!(SessionState::from(99), SessionState::Disconnected);
    }
}
