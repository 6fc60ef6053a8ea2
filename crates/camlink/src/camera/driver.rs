//! Driver adapter seam.
//!
//! The device-control protocol itself (capability negotiation, PTP/IP framing, USB) lives in an
//! external driver library. Everything in this crate reaches it through the two traits below.
//! All methods block; callers are responsible for keeping them off latency-sensitive threads.

use std::path::Path;
use std::sync::Arc;

/// Which rendition of a file to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// The full-resolution original.
    Normal,
    /// The embedded preview/thumbnail rendition.
    Preview,
}

/// Transport kind of a driver endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Usb,
    Ip,
    PtpIp,
    Serial,
    Disk,
    Other,
}

impl PortKind {
    /// Network endpoints are the fallback when no endpoint matches a requested path.
    pub fn is_network(self) -> bool {
        matches!(self, Self::Ip | Self::PtpIp)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Usb => "USB",
            Self::Ip => "IP",
            Self::PtpIp => "PTP/IP",
            Self::Serial => "Serial",
            Self::Disk => "Disk",
            Self::Other => "Unknown",
        }
    }
}

/// A transport endpoint the driver knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    /// For example "ptpip:192.168.1.1:15740" or "usb:001,005".
    pub path: String,
    pub kind: PortKind,
}

/// A capability profile for one camera model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraAbilities {
    pub model: String,
}

/// A camera reported by driver autodetection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedCamera {
    pub model: String,
    pub path: String,
}

/// Errors reported by the driver library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The plugin loader could not be initialized.
    Loader(String),
    /// The operation is not supported by this camera/driver.
    NotSupported,
    /// No such file or folder on the device.
    NotFound(String),
    /// The device stopped answering in time.
    Timeout,
    /// The transport went away (camera powered off, Wi-Fi dropped).
    Disconnected,
    /// The device answered with a protocol-level failure.
    Protocol { code: i32, message: String },
    /// Anything else.
    Other(String),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loader(msg) => write!(f, "driver loader failed: {msg}"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Disconnected => write!(f, "device disconnected"),
            Self::Protocol { code, message } => write!(f, "protocol error {code}: {message}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for DriverError {}

/// Byte-level progress callbacks, registered on a handle for the duration of one transfer.
pub trait ProgressSink: Send + Sync {
    /// Transfer started; `target` is the expected size in bytes.
    fn start(&self, target: u64, label: &str);
    /// `current` bytes have been received so far.
    fn update(&self, current: u64);
    /// Transfer finished (successfully or not).
    fn stop(&self);
}

/// Entry point into the driver library.
pub trait CameraDriver: Send + Sync {
    /// Initializes the plugin loader. Idempotent.
    fn init_loader(&self, search_path: Option<&Path>) -> Result<(), DriverError>;

    /// Lists cameras currently reachable (model + endpoint path).
    fn autodetect(&self) -> Result<Vec<DetectedCamera>, DriverError>;

    /// Lists every capability profile the loaded plugins provide.
    fn abilities(&self) -> Result<Vec<CameraAbilities>, DriverError>;

    /// Lists every transport endpoint the loaded plugins provide.
    fn ports(&self) -> Result<Vec<PortInfo>, DriverError>;

    /// Binds a capability profile and an endpoint into a (not yet initialized) handle.
    fn bind(&self, abilities: &CameraAbilities, port: &PortInfo) -> Result<Arc<dyn CameraHandle>, DriverError>;
}

/// A bound camera. `init` must succeed before any other call is meaningful.
pub trait CameraHandle: Send + Sync {
    /// Device-level session initialization (the protocol handshake).
    fn init(&self) -> Result<(), DriverError>;

    /// Closes the device session. The handle is unusable afterwards.
    fn exit(&self) -> Result<(), DriverError>;

    /// One cheap round-trip (for example reading the battery level) to detect silent disconnects.
    fn probe(&self) -> Result<(), DriverError>;

    /// Lists sub-folder names of `folder` ("/" is the device root).
    fn list_folders(&self, folder: &str) -> Result<Vec<String>, DriverError>;

    /// Lists file names directly inside `folder`, in device order.
    fn list_files(&self, folder: &str) -> Result<Vec<String>, DriverError>;

    /// Fetches a file's bytes.
    fn get_file(&self, folder: &str, name: &str, kind: FileKind) -> Result<Vec<u8>, DriverError>;

    /// Installs or clears the progress callbacks used by `get_file`.
    fn set_progress_sink(&self, sink: Option<Arc<dyn ProgressSink>>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_port_kinds() {
        assert!(PortKind::Ip.is_network());
        assert!(PortKind::PtpIp.is_network());
        assert!(!PortKind::Usb.is_network());
        assert!(!PortKind::Disk.is_network());
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Protocol {
            code: -7,
            message: "I/O problem".to_string(),
        };
        assert_eq!(err.to_string(), "protocol error -7: I/O problem");
        assert_eq!(DriverError::Timeout.to_string(), "timed out");
    }
}
