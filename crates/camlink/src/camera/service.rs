//! `CameraService`: the operations a host calls.
//!
//! Wires one [`SessionManager`] to the catalog and download pipeline, and routes asynchronous
//! requests through the [`AsyncBridge`]. Methods here return plain values (`bool`, empty
//! collections) the way a UI binding wants them; the reason for a failure is kept and can be
//! read with [`CameraService::last_error`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::runtime::Handle;

use super::bridge::{AsyncBridge, Ticket};
use super::catalog::CatalogBuilder;
use super::discovery;
use super::driver::CameraDriver;
use super::session::{CameraError, LastError, SessionManager};
use super::transfer::DownloadPipeline;
use super::transfer::progress::ProgressCallback;
use super::types::{CameraDeviceInfo, ConnectionStatus, FileDescriptor, ScanProgress};
use crate::config::CameraConfig;

pub struct CameraService {
    last_error: Arc<LastError>,
    sessions: Arc<SessionManager>,
    catalog: Arc<CatalogBuilder>,
    pipeline: Arc<DownloadPipeline>,
    bridge: AsyncBridge,
}

impl CameraService {
    /// Creates a service with its own background runtime for asynchronous requests.
    pub fn new(driver: Arc<dyn CameraDriver>, config: CameraConfig) -> Result<Self, CameraError> {
        Ok(Self::build(driver, config, AsyncBridge::new()?))
    }

    /// Creates a service that schedules asynchronous requests on an existing runtime.
    pub fn with_runtime(driver: Arc<dyn CameraDriver>, config: CameraConfig, handle: Handle) -> Self {
        Self::build(driver, config, AsyncBridge::with_handle(handle))
    }

    fn build(driver: Arc<dyn CameraDriver>, config: CameraConfig, bridge: AsyncBridge) -> Self {
        debug!("Camera service config: {:?}", config);
        let last_error = Arc::new(LastError::default());
        let catalog = Arc::new(CatalogBuilder::new(config.scan_join_timeout()));
        let pipeline = Arc::new(DownloadPipeline::new(
            config.thumbnail_concurrency,
            config.thumbnail_timeout(),
            config.scan_join_timeout(),
        ));
        let sessions = Arc::new(SessionManager::new(driver, config, Arc::clone(&last_error)));
        sessions.add_listener(catalog.clone());
        sessions.add_listener(pipeline.clone());
        Self {
            last_error,
            sessions,
            catalog,
            pipeline,
            bridge,
        }
    }

    fn record<T>(&self, result: Result<T, CameraError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.last_error.record(&e);
                None
            }
        }
    }

    // ============================================================================
    // Session
    // ============================================================================

    /// Connects to `model` at `path` ("ptpip:host:port", "usb:bus,dev", or a bare IP address).
    pub fn connect(&self, model: &str, path: &str) -> bool {
        self.record(self.sessions.connect(model, path)).is_some()
    }

    /// Connects to a camera acting as a Wi-Fi access point.
    pub fn connect_access_point(&self, model: &str, address: &str, port: u16) -> bool {
        self.record(self.sessions.connect_access_point(model, address, port)).is_some()
    }

    pub fn disconnect(&self) -> bool {
        self.record(self.sessions.disconnect()).is_some()
    }

    /// Live check; a camera that stopped answering is disconnected as a side effect.
    pub fn is_connected(&self) -> bool {
        self.sessions.is_connected()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.sessions.status()
    }

    pub fn scan_available_devices(&self) -> Vec<CameraDeviceInfo> {
        let search_path = self.sessions.driver_search_path();
        discovery::scan_available_devices(self.sessions.driver().as_ref(), search_path.as_deref())
    }

    pub fn set_driver_search_path(&self, path: &str) {
        self.sessions.set_driver_search_path(PathBuf::from(path));
    }

    // ============================================================================
    // Catalog
    // ============================================================================

    /// Starts a background scan. False if not connected or a scan is already running.
    pub fn start_scan(&self) -> bool {
        self.record(self.catalog.start_scan()).is_some()
    }

    pub fn cancel_scan(&self) {
        self.catalog.cancel_scan();
    }

    pub fn get_scan_progress(&self) -> ScanProgress {
        self.catalog.progress()
    }

    pub fn is_scan_complete(&self) -> bool {
        self.catalog.is_scan_complete()
    }

    pub fn scan_failure(&self) -> Option<String> {
        self.catalog.scan_failure()
    }

    /// Cached photo count. Starts a background scan and returns 0 if nothing was scanned yet.
    pub fn get_photo_total_count(&self) -> usize {
        self.catalog.photo_total_count()
    }

    /// One page of photos. Blocks on an inline scan if the catalog isn't complete yet.
    pub fn get_photo_meta_list(&self, page_index: usize, page_size: usize) -> Vec<FileDescriptor> {
        self.record(self.catalog.photo_page(page_index, page_size))
            .unwrap_or_default()
    }

    pub fn clear_cache(&self) {
        self.catalog.clear_cache();
    }

    // ============================================================================
    // Downloads
    // ============================================================================

    pub fn set_thumbnail_timeout(&self, timeout: Duration) {
        self.pipeline.set_thumbnail_timeout(timeout);
    }

    /// Preview bytes, or empty if unavailable right now.
    pub fn download_thumbnail(&self, folder: &str, file_name: &str) -> Vec<u8> {
        self.record(self.pipeline.download_thumbnail(folder, file_name))
            .unwrap_or_default()
    }

    /// Fetches a preview on a worker thread; `completion` gets the bytes or the error.
    pub fn download_thumbnail_async<C>(&self, folder: &str, file_name: &str, completion: C) -> Ticket
    where
        C: FnOnce(Result<Vec<u8>, CameraError>) + Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        let last_error = Arc::clone(&self.last_error);
        let folder = folder.to_string();
        let file_name = file_name.to_string();
        self.bridge.submit(
            "thumbnail",
            move || pipeline.download_thumbnail(&folder, &file_name),
            move |result| {
                if let Err(e) = &result {
                    last_error.record(e);
                }
                completion(result);
            },
        )
    }

    /// Downloads the full file to `destination`. Blocks for the whole transfer.
    pub fn download_file(&self, folder: &str, file_name: &str, destination: &str) -> bool {
        self.download_file_with_progress(folder, file_name, destination, None)
    }

    pub fn download_file_with_progress(
        &self,
        folder: &str,
        file_name: &str,
        destination: &str,
        on_progress: Option<ProgressCallback>,
    ) -> bool {
        self.record(
            self.pipeline
                .download_file(folder, file_name, destination, on_progress),
        )
        .is_some()
    }

    /// Downloads on a worker thread; `completion` gets the written path or the error.
    pub fn download_file_async<C>(&self, folder: &str, file_name: &str, destination: &str, completion: C) -> Ticket
    where
        C: FnOnce(Result<PathBuf, CameraError>) + Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        let last_error = Arc::clone(&self.last_error);
        let folder = folder.to_string();
        let file_name = file_name.to_string();
        let destination = destination.to_string();
        self.bridge.submit(
            "download",
            move || pipeline.download_file(&folder, &file_name, &destination, None),
            move |result| {
                if let Err(e) = &result {
                    last_error.record(e);
                }
                completion(result);
            },
        )
    }

    // ============================================================================
    // Errors
    // ============================================================================

    pub fn last_error(&self) -> Option<CameraError> {
        self.last_error.get()
    }

    /// The last error as text, empty if none.
    pub fn last_error_message(&self) -> String {
        self.last_error.get().map(|e| e.to_string()).unwrap_or_default()
    }
}
