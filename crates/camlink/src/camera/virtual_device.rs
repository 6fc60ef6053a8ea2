//! In-memory camera driver.
//!
//! Backs the test suite and the `virtual-device` feature, so the full session/catalog/download
//! flow can run without hardware. Supports per-call latency, fault injection and counters for
//! open/closed handles and concurrent fetches.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;

use super::driver::{
    CameraAbilities, CameraDriver, CameraHandle, DetectedCamera, DriverError, FileKind, PortInfo, PortKind,
    ProgressSink,
};
use crate::ignore_poison::IgnorePoison;

/// Chunk size used to drive progress callbacks during a full fetch.
const PROGRESS_CHUNK: usize = 64 * 1024;

/// A driver call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Loader,
    Autodetect,
    Handshake,
    ListFolders,
    ListFiles,
    GetFile,
    /// `probe` reports the transport as gone.
    Probe,
}

#[derive(Default)]
struct VirtualFolder {
    subfolders: Vec<String>,
    files: Vec<VirtualFile>,
}

struct VirtualFile {
    name: String,
    data: Vec<u8>,
    preview: Vec<u8>,
}

#[derive(Default)]
struct Shared {
    models: Mutex<Vec<String>>,
    ports: Mutex<Vec<PortInfo>>,
    detected: Mutex<Vec<DetectedCamera>>,
    tree: Mutex<BTreeMap<String, VirtualFolder>>,
    faults: Mutex<HashSet<Fault>>,
    fetch_latency: Mutex<Duration>,
    list_latency: Mutex<Duration>,
    handshake_delay: Mutex<Duration>,
    events: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetches: AtomicUsize,
    busy: AtomicUsize,
    exits_while_busy: AtomicUsize,
    handles_opened: AtomicUsize,
    handles_closed: AtomicUsize,
    sink_installed: AtomicBool,
    loader_search_path: Mutex<Option<String>>,
}

impl Shared {
    fn fault(&self, fault: Fault) -> bool {
        self.faults.lock_ignore_poison().contains(&fault)
    }

    fn record(&self, event: String) {
        debug!("virtual camera: {event}");
        self.events.lock_ignore_poison().push(event);
    }
}

/// An in-memory camera driver. Cloning shares the same device.
#[derive(Clone, Default)]
pub struct VirtualCameraDriver {
    shared: Arc<Shared>,
}

fn join_path(folder: &str, name: &str) -> String {
    if folder.ends_with('/') {
        format!("{folder}{name}")
    } else {
        format!("{folder}/{name}")
    }
}

impl VirtualCameraDriver {
    pub fn new() -> Self {
        let driver = Self::default();
        driver.shared.tree.lock_ignore_poison().insert("/".to_string(), VirtualFolder::default());
        driver
    }

    /// A Nikon on its own access point, with one DCIM folder holding five photos and a sidecar.
    pub fn nikon_over_wifi() -> Self {
        let driver = Self::new()
            .with_model("Nikon Z 6")
            .with_model("Canon EOS R5")
            .with_port("ptpip:", PortKind::PtpIp)
            .with_port("usb:001,004", PortKind::Usb)
            .with_detected("Nikon Z 6", "ptpip:192.168.1.1:15740");
        let folder = "/store_00010001/DCIM/100NCZ_6";
        driver
            .with_file(folder, "DSC_0001.NEF", vec![1; 300_000])
            .with_file(folder, "DSC_0001.JPG", vec![2; 120_000])
            .with_file(folder, "DSC_0002.nef", vec![3; 280_000])
            .with_file(folder, "NOTES.TXT", b"not a photo".to_vec())
            .with_file(folder, "DSC_0003.jpeg", vec![4; 90_000])
            .with_file(folder, "DSC_0004.ARW", vec![5; 10_000])
    }

    pub fn with_model(self, model: &str) -> Self {
        self.shared.models.lock_ignore_poison().push(model.to_string());
        self
    }

    pub fn with_port(self, path: &str, kind: PortKind) -> Self {
        self.shared.ports.lock_ignore_poison().push(PortInfo {
            name: kind.label().to_string(),
            path: path.to_string(),
            kind,
        });
        self
    }

    pub fn with_detected(self, model: &str, path: &str) -> Self {
        self.shared.detected.lock_ignore_poison().push(DetectedCamera {
            model: model.to_string(),
            path: path.to_string(),
        });
        self
    }

    /// Adds a folder (and its missing parents).
    pub fn with_folder(self, path: &str) -> Self {
        self.ensure_folder(path);
        self
    }

    /// Adds a file whose preview is derived from its name.
    pub fn with_file(self, folder: &str, name: &str, data: Vec<u8>) -> Self {
        let preview = format!("preview:{name}").into_bytes();
        self.with_file_and_preview(folder, name, data, preview)
    }

    pub fn with_file_and_preview(self, folder: &str, name: &str, data: Vec<u8>, preview: Vec<u8>) -> Self {
        self.ensure_folder(folder);
        let mut tree = self.shared.tree.lock_ignore_poison();
        if let Some(entry) = tree.get_mut(folder) {
            entry.files.push(VirtualFile {
                name: name.to_string(),
                data,
                preview,
            });
        }
        drop(tree);
        self
    }

    fn ensure_folder(&self, path: &str) {
        let mut tree = self.shared.tree.lock_ignore_poison();
        let mut parent = "/".to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let child = join_path(&parent, segment);
            if !tree.contains_key(&child) {
                tree.insert(child.clone(), VirtualFolder::default());
                if let Some(p) = tree.get_mut(&parent) {
                    p.subfolders.push(segment.to_string());
                }
            }
            parent = child;
        }
    }

    pub fn fail(&self, fault: Fault) {
        self.shared.faults.lock_ignore_poison().insert(fault);
    }

    pub fn heal(&self, fault: Fault) {
        self.shared.faults.lock_ignore_poison().remove(&fault);
    }

    /// Delay applied inside every `get_file` call.
    pub fn set_fetch_latency(&self, latency: Duration) {
        *self.shared.fetch_latency.lock_ignore_poison() = latency;
    }

    /// Delay applied inside every `list_files` call.
    pub fn set_list_latency(&self, latency: Duration) {
        *self.shared.list_latency.lock_ignore_poison() = latency;
    }

    /// Delay applied inside the handshake.
    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.shared.handshake_delay.lock_ignore_poison() = delay;
    }

    /// Highest number of `get_file` calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.shared.fetches.load(Ordering::SeqCst)
    }

    pub fn handles_opened(&self) -> usize {
        self.shared.handles_opened.load(Ordering::SeqCst)
    }

    pub fn handles_closed(&self) -> usize {
        self.shared.handles_closed.load(Ordering::SeqCst)
    }

    /// Handles that were bound but never exited.
    pub fn live_handles(&self) -> usize {
        self.handles_opened().saturating_sub(self.handles_closed())
    }

    /// Times a handle was exited while a listing or transfer call was still inside it.
    pub fn exits_while_busy(&self) -> usize {
        self.shared.exits_while_busy.load(Ordering::SeqCst)
    }

    /// Whether any handle currently has progress callbacks installed.
    pub fn progress_sink_installed(&self) -> bool {
        self.shared.sink_installed.load(Ordering::SeqCst)
    }

    pub fn loader_search_path(&self) -> Option<String> {
        self.shared.loader_search_path.lock_ignore_poison().clone()
    }

    /// Lifecycle log: "bind:N", "init:N", "exit:N".
    pub fn events(&self) -> Vec<String> {
        self.shared.events.lock_ignore_poison().clone()
    }
}

impl CameraDriver for VirtualCameraDriver {
    fn init_loader(&self, search_path: Option<&Path>) -> Result<(), DriverError> {
        if self.shared.fault(Fault::Loader) {
            return Err(DriverError::Loader("no camera plugins found".to_string()));
        }
        *self.shared.loader_search_path.lock_ignore_poison() = search_path.map(|p| p.display().to_string());
        Ok(())
    }

    fn autodetect(&self) -> Result<Vec<DetectedCamera>, DriverError> {
        if self.shared.fault(Fault::Autodetect) {
            return Err(DriverError::Other("autodetect failed".to_string()));
        }
        Ok(self.shared.detected.lock_ignore_poison().clone())
    }

    fn abilities(&self) -> Result<Vec<CameraAbilities>, DriverError> {
        Ok(self
            .shared
            .models
            .lock_ignore_poison()
            .iter()
            .map(|model| CameraAbilities { model: model.clone() })
            .collect())
    }

    fn ports(&self) -> Result<Vec<PortInfo>, DriverError> {
        Ok(self.shared.ports.lock_ignore_poison().clone())
    }

    fn bind(&self, abilities: &CameraAbilities, port: &PortInfo) -> Result<Arc<dyn CameraHandle>, DriverError> {
        let id = self.shared.handles_opened.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.record(format!("bind:{id}"));
        debug!("virtual camera: bound {} at {}", abilities.model, port.path);
        Ok(Arc::new(VirtualCameraHandle {
            id,
            shared: Arc::clone(&self.shared),
            sink: Mutex::new(None),
            exited: AtomicBool::new(false),
        }))
    }
}

struct VirtualCameraHandle {
    id: usize,
    shared: Arc<Shared>,
    sink: Mutex<Option<Arc<dyn ProgressSink>>>,
    exited: AtomicBool,
}

impl VirtualCameraHandle {
    fn check_open(&self) -> Result<(), DriverError> {
        if self.exited.load(Ordering::SeqCst) {
            Err(DriverError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn with_file<T>(&self, folder: &str, name: &str, f: impl FnOnce(&VirtualFile) -> T) -> Result<T, DriverError> {
        let tree = self.shared.tree.lock_ignore_poison();
        tree.get(folder)
            .and_then(|entry| entry.files.iter().find(|file| file.name == name))
            .map(f)
            .ok_or_else(|| DriverError::NotFound(join_path(folder, name)))
    }
}

/// Tracks concurrent fetches for the lifetime of one `get_file` call.
struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        shared.fetches.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a listing or transfer call as running, so an `exit` during it can be counted.
struct Busy<'a>(&'a Shared);

impl<'a> Busy<'a> {
    fn enter(shared: &'a Shared) -> Self {
        shared.busy.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CameraHandle for VirtualCameraHandle {
    fn init(&self) -> Result<(), DriverError> {
        self.shared.record(format!("init:{}", self.id));
        let delay = *self.shared.handshake_delay.lock_ignore_poison();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.shared.fault(Fault::Handshake) {
            return Err(DriverError::Protocol {
                code: -7,
                message: "PTP/IP init command ack not received".to_string(),
            });
        }
        Ok(())
    }

    fn exit(&self) -> Result<(), DriverError> {
        if !self.exited.swap(true, Ordering::SeqCst) {
            if self.shared.busy.load(Ordering::SeqCst) > 0 {
                self.shared.exits_while_busy.fetch_add(1, Ordering::SeqCst);
            }
            self.shared.handles_closed.fetch_add(1, Ordering::SeqCst);
            self.shared.record(format!("exit:{}", self.id));
        }
        Ok(())
    }

    fn probe(&self) -> Result<(), DriverError> {
        self.check_open()?;
        if self.shared.fault(Fault::Probe) {
            return Err(DriverError::Disconnected);
        }
        Ok(())
    }

    fn list_folders(&self, folder: &str) -> Result<Vec<String>, DriverError> {
        self.check_open()?;
        let _busy = Busy::enter(&self.shared);
        if self.shared.fault(Fault::ListFolders) {
            return Err(DriverError::Protocol {
                code: -1,
                message: "folder listing failed".to_string(),
            });
        }
        let tree = self.shared.tree.lock_ignore_poison();
        tree.get(folder)
            .map(|entry| entry.subfolders.clone())
            .ok_or_else(|| DriverError::NotFound(folder.to_string()))
    }

    fn list_files(&self, folder: &str) -> Result<Vec<String>, DriverError> {
        self.check_open()?;
        let _busy = Busy::enter(&self.shared);
        let latency = *self.shared.list_latency.lock_ignore_poison();
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if self.shared.fault(Fault::ListFiles) {
            return Err(DriverError::Protocol {
                code: -1,
                message: "file listing failed".to_string(),
            });
        }
        let tree = self.shared.tree.lock_ignore_poison();
        tree.get(folder)
            .map(|entry| entry.files.iter().map(|f| f.name.clone()).collect())
            .ok_or_else(|| DriverError::NotFound(folder.to_string()))
    }

    fn get_file(&self, folder: &str, name: &str, kind: FileKind) -> Result<Vec<u8>, DriverError> {
        self.check_open()?;
        let _busy = Busy::enter(&self.shared);
        let _in_flight = InFlight::enter(&self.shared);
        let latency = *self.shared.fetch_latency.lock_ignore_poison();
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if self.shared.fault(Fault::GetFile) {
            return Err(DriverError::Protocol {
                code: -1,
                message: "transfer aborted".to_string(),
            });
        }

        let bytes = self.with_file(folder, name, |file| match kind {
            FileKind::Normal => file.data.clone(),
            FileKind::Preview => file.preview.clone(),
        })?;

        if kind == FileKind::Normal {
            let sink = self.sink.lock_ignore_poison().clone();
            if let Some(sink) = sink {
                let total = bytes.len() as u64;
                sink.start(total, name);
                let mut done = 0usize;
                while done < bytes.len() {
                    done = (done + PROGRESS_CHUNK).min(bytes.len());
                    sink.update(done as u64);
                }
                sink.stop();
            }
        }
        Ok(bytes)
    }

    fn set_progress_sink(&self, sink: Option<Arc<dyn ProgressSink>>) {
        self.shared.sink_installed.store(sink.is_some(), Ordering::SeqCst);
        *self.sink.lock_ignore_poison() = sink;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_builds_parents() {
        let driver = VirtualCameraDriver::new().with_file("/store/DCIM/100TEST", "A.JPG", vec![1]);
        let handle = driver
            .bind(&CameraAbilities { model: "X".into() }, &PortInfo {
                name: "PTP/IP".into(),
                path: "ptpip:".into(),
                kind: PortKind::PtpIp,
            })
            .unwrap();
        assert_eq!(handle.list_folders("/").unwrap(), vec!["store"]);
        assert_eq!(handle.list_folders("/store").unwrap(), vec!["DCIM"]);
        assert_eq!(handle.list_files("/store/DCIM/100TEST").unwrap(), vec!["A.JPG"]);
    }

    #[test]
    fn test_exit_counts_once_and_blocks_further_calls() {
        let driver = VirtualCameraDriver::nikon_over_wifi();
        let abilities = CameraAbilities {
            model: "Nikon Z 6".into(),
        };
        let port = driver.ports().unwrap()[0].clone();
        let handle = driver.bind(&abilities, &port).unwrap();
        handle.exit().unwrap();
        handle.exit().unwrap();
        assert_eq!(driver.handles_closed(), 1);
        assert_eq!(handle.probe(), Err(DriverError::Disconnected));
        assert_eq!(driver.live_handles(), 0);
    }

    #[test]
    fn test_preview_and_missing_file() {
        let driver = VirtualCameraDriver::nikon_over_wifi();
        let port = driver.ports().unwrap()[0].clone();
        let handle = driver
            .bind(&CameraAbilities { model: "Nikon Z 6".into() }, &port)
            .unwrap();
        let folder = "/store_00010001/DCIM/100NCZ_6";
        assert_eq!(
            handle.get_file(folder, "DSC_0001.NEF", FileKind::Preview).unwrap(),
            b"preview:DSC_0001.NEF".to_vec()
        );
        assert!(matches!(
            handle.get_file(folder, "MISSING.NEF", FileKind::Normal),
            Err(DriverError::NotFound(_))
        ));
        assert_eq!(driver.fetch_count(), 2);
    }
}
