//! camlink: session, catalog and download pipeline for PTP/IP tethered cameras.
//!
//! The device protocol itself is reached through [`camera::CameraDriver`]. Everything on top of
//! it (one live session at a time, a cancellable background catalog scan, bounded thumbnail
//! fetches, full downloads with progress) lives here. Hosts normally only touch
//! [`CameraService`].

pub mod camera;
pub mod config;
mod ignore_poison;
pub mod logging;

pub use camera::{
    CameraDeviceInfo, CameraDriver, CameraError, CameraService, ConnectionStatus, ConnectionType, DownloadProgress,
    FileDescriptor, ScanProgress, ScanState,
};
pub use config::{CameraConfig, CameraSettings};
pub use logging::{init_logging, set_log_level};
