//! Camera module - session lifecycle, photo catalog, downloads, async bridge.

pub mod bridge;
pub mod catalog;
pub mod discovery;
pub mod driver;
pub mod service;
pub mod session;
pub mod transfer;
pub mod types;

#[cfg(any(test, feature = "virtual-device"))]
pub mod virtual_device;

pub use bridge::{AsyncBridge, Ticket};
pub use driver::{CameraDriver, CameraHandle, DriverError, FileKind, PortInfo, PortKind, ProgressSink};
pub use service::CameraService;
pub use session::port::{DEFAULT_ACCESS_POINT_ADDRESS, DEFAULT_PTPIP_PORT};
pub use session::{CameraError, DeviceSession, SessionListener, SessionManager};
pub use types::{
    CameraDeviceInfo, ConnectionStatus, ConnectionType, DownloadProgress, FileDescriptor, ScanProgress, ScanState,
    SessionState,
};
