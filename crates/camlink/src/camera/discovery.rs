//! Camera discovery through driver autodetection.

use std::path::Path;

use log::{debug, warn};

use super::driver::CameraDriver;
use super::types::{CameraDeviceInfo, ConnectionType};

/// Lists reachable cameras, sorted by model. Driver failures are logged and give an empty list.
pub fn scan_available_devices(driver: &dyn CameraDriver, search_path: Option<&Path>) -> Vec<CameraDeviceInfo> {
    if let Err(e) = driver.init_loader(search_path) {
        warn!("Camera discovery skipped, driver loader failed: {}", e);
        return Vec::new();
    }
    let detected = match driver.autodetect() {
        Ok(detected) => detected,
        Err(e) => {
            warn!("Camera autodetection failed: {}", e);
            return Vec::new();
        }
    };

    let mut devices: Vec<CameraDeviceInfo> = detected
        .into_iter()
        .map(|camera| CameraDeviceInfo {
            display_name: format!("{} @ {}", camera.model, camera.path),
            connection_type: ConnectionType::from_path(&camera.path),
            model: camera.model,
            path: camera.path,
        })
        .collect();
    devices.sort_by(|a, b| a.model.cmp(&b.model));
    debug!("Discovered {} camera(s)", devices.len());
    devices
}
