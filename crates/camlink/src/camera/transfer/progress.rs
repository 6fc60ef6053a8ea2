//! Byte progress of full-resolution downloads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};

use crate::camera::driver::ProgressSink;
use crate::camera::session::DeviceSession;
use crate::camera::types::DownloadProgress;

/// Called with every progress update of a download.
pub type ProgressCallback = Box<dyn Fn(DownloadProgress) + Send + Sync>;

/// Accumulates driver progress callbacks for one file.
pub struct TransferProgress {
    file_name: String,
    total: AtomicU64,
    done: AtomicU64,
    on_progress: Option<ProgressCallback>,
}

impl TransferProgress {
    pub fn new(file_name: &str, on_progress: Option<ProgressCallback>) -> Self {
        Self {
            file_name: file_name.to_string(),
            total: AtomicU64::new(0),
            done: AtomicU64::new(0),
            on_progress,
        }
    }

    pub fn snapshot(&self) -> DownloadProgress {
        let bytes_total = self.total.load(Ordering::SeqCst);
        let bytes_done = self.done.load(Ordering::SeqCst);
        let fraction = if bytes_total == 0 {
            0.0
        } else {
            (bytes_done as f64 / bytes_total as f64).min(1.0)
        };
        DownloadProgress {
            file_name: self.file_name.clone(),
            bytes_done,
            bytes_total,
            fraction,
        }
    }

    fn emit(&self) {
        if let Some(callback) = &self.on_progress {
            callback(self.snapshot());
        }
    }
}

impl ProgressSink for TransferProgress {
    fn start(&self, target: u64, label: &str) {
        debug!("Transfer of {} started ({} bytes, {})", self.file_name, target, label);
        self.total.store(target, Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        self.emit();
    }

    fn update(&self, current: u64) {
        self.done.store(current, Ordering::SeqCst);
        self.emit();
    }

    fn stop(&self) {
        let progress = self.snapshot();
        info!(
            "Transfer of {} finished at {:.0}% ({}/{} bytes)",
            self.file_name,
            progress.fraction * 100.0,
            progress.bytes_done,
            progress.bytes_total
        );
    }
}

/// Installs a progress sink on the session for as long as it lives.
///
/// Dropping it unregisters the sink, whatever path the transfer took.
pub struct ProgressRegistration<'a> {
    session: &'a DeviceSession,
}

impl<'a> ProgressRegistration<'a> {
    pub fn install(session: &'a DeviceSession, sink: Arc<dyn ProgressSink>) -> Self {
        session.with_driver(|handle| handle.set_progress_sink(Some(sink)));
        Self { session }
    }
}

impl Drop for ProgressRegistration<'_> {
    fn drop(&mut self) {
        self.session.with_driver(|handle| handle.set_progress_sink(None));
    }
}
