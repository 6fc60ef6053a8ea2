//! Download pipeline: gated thumbnail fetches and ungated full-resolution downloads.
//!
//! Thumbnails hold a gate slot only for the driver call itself. Full downloads run one at a time,
//! since the progress sink lives on the shared handle. Each one registers its sink for the
//! duration of the call and writes through a `.part` file that is renamed into place on success
//! and removed on failure.
//!
//! Every transfer registers with [`ActiveWork`] before it looks at the session. Disconnect marks
//! the session closing and then waits for that count to reach zero, so a transfer either sees the
//! closing flag or is waited for.

pub mod gate;
pub mod progress;

#[cfg(test)]
mod transfer_test;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::driver::FileKind;
use super::session::{CameraError, DeviceSession, SessionListener};
use crate::ignore_poison::IgnorePoison;
use gate::{ConcurrencyGate, GateError};
use progress::{ProgressCallback, ProgressRegistration, TransferProgress};

/// Counts work that may reach the driver, so disconnect can wait for it.
#[derive(Default)]
pub(crate) struct ActiveWork {
    count: Mutex<usize>,
    idle: Condvar,
}

impl ActiveWork {
    pub(crate) fn enter(&self) -> ActiveGuard<'_> {
        *self.count.lock_ignore_poison() += 1;
        ActiveGuard(self)
    }

    /// Waits until nothing is running. Returns false on timeout.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let count = self.count.lock_ignore_poison();
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |n| *n > 0)
            .unwrap_or_else(|e| e.into_inner());
        *count == 0
    }
}

pub(crate) struct ActiveGuard<'a>(&'a ActiveWork);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.0.count.lock_ignore_poison();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Where a download ends up. A directory destination keeps the camera's file name.
fn resolve_destination(destination: &str, file_name: &str) -> Result<PathBuf, CameraError> {
    if destination.trim().is_empty() {
        return Err(CameraError::InvalidDestination {
            path: destination.to_string(),
        });
    }
    let path = expand_tilde(destination);
    if path.is_dir() {
        Ok(path.join(file_name))
    } else {
        Ok(path)
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Writes `bytes` next to `destination` and renames into place. Nothing is left behind on failure.
fn write_atomically(destination: &Path, bytes: &[u8]) -> Result<(), CameraError> {
    let part = partial_path(destination);
    let io_error = |e: std::io::Error| CameraError::Io {
        path: destination.display().to_string(),
        message: e.to_string(),
    };
    let result = fs::write(&part, bytes).and_then(|()| fs::rename(&part, destination));
    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&part)
            && cleanup.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Couldn't remove partial download {}: {}", part.display(), cleanup);
        }
        return Err(io_error(e));
    }
    Ok(())
}

/// Thumbnail and full-file transfers for the current session.
pub struct DownloadPipeline {
    session: Mutex<Weak<DeviceSession>>,
    gate: ConcurrencyGate,
    capacity: usize,
    thumbnail_timeout: Mutex<Duration>,
    active: ActiveWork,
    /// Held for a whole full download.
    full_download: Mutex<()>,
    drain_timeout: Duration,
}

impl DownloadPipeline {
    pub fn new(capacity: usize, thumbnail_timeout: Duration, drain_timeout: Duration) -> Self {
        Self {
            session: Mutex::new(Weak::new()),
            gate: ConcurrencyGate::new(),
            capacity: capacity.max(1),
            thumbnail_timeout: Mutex::new(thumbnail_timeout),
            active: ActiveWork::default(),
            full_download: Mutex::new(()),
            drain_timeout,
        }
    }

    pub fn set_thumbnail_timeout(&self, timeout: Duration) {
        debug!("Thumbnail timeout set to {}ms", timeout.as_millis());
        *self.thumbnail_timeout.lock_ignore_poison() = timeout;
    }

    pub fn thumbnail_timeout(&self) -> Duration {
        *self.thumbnail_timeout.lock_ignore_poison()
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    fn live_session(&self) -> Result<Arc<DeviceSession>, CameraError> {
        match self.session.lock_ignore_poison().upgrade() {
            Some(session) if !session.is_closing() => Ok(session),
            Some(_) => Err(CameraError::Disconnecting),
            None => Err(CameraError::NotConnected),
        }
    }

    /// Fetches the preview rendition of a file.
    ///
    /// Waits at most the thumbnail timeout for a gate slot; `Busy` means try again later.
    pub fn download_thumbnail(&self, folder: &str, file_name: &str) -> Result<Vec<u8>, CameraError> {
        let bytes = {
            let _active = self.active.enter();
            let session = self.live_session()?;
            let timeout = self.thumbnail_timeout();
            let _permit = self.gate.acquire(timeout).map_err(|e| match e {
                GateError::TimedOut => {
                    debug!("No thumbnail slot for {}/{} within {}ms", folder, file_name, timeout.as_millis());
                    CameraError::Busy
                }
                GateError::Closed => CameraError::NotConnected,
            })?;
            if session.is_closing() {
                return Err(CameraError::Disconnecting);
            }
            session.with_driver(|handle| handle.get_file(folder, file_name, FileKind::Preview))
        };

        let bytes = bytes.map_err(|e| {
            warn!("Thumbnail fetch failed for {}/{}: {}", folder, file_name, e);
            CameraError::Transfer {
                folder: folder.to_string(),
                file: file_name.to_string(),
                message: e.to_string(),
            }
        })?;
        if bytes.is_empty() {
            warn!("Empty thumbnail for {}/{}", folder, file_name);
            return Err(CameraError::EmptyPayload {
                folder: folder.to_string(),
                file: file_name.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Downloads the full file to `destination`, reporting byte progress to `on_progress`.
    ///
    /// Blocks for the whole transfer. Returns the path written.
    pub fn download_file(
        &self,
        folder: &str,
        file_name: &str,
        destination: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, CameraError> {
        let started = Instant::now();
        let (target, fetched) = {
            let _active = self.active.enter();
            let session = self.live_session()?;
            let target = resolve_destination(destination, file_name)?;

            let _exclusive = self.full_download.lock_ignore_poison();
            if session.is_closing() {
                return Err(CameraError::Disconnecting);
            }
            info!("Downloading {}/{} to {}", folder, file_name, target.display());
            let progress = Arc::new(TransferProgress::new(file_name, on_progress));
            let _registration = ProgressRegistration::install(&session, progress);
            (target, session.with_driver(|handle| handle.get_file(folder, file_name, FileKind::Normal)))
        };

        let bytes = fetched.map_err(|e| {
            error!("Download of {}/{} failed: {}", folder, file_name, e);
            CameraError::Transfer {
                folder: folder.to_string(),
                file: file_name.to_string(),
                message: e.to_string(),
            }
        })?;
        if bytes.is_empty() {
            return Err(CameraError::EmptyPayload {
                folder: folder.to_string(),
                file: file_name.to_string(),
            });
        }

        write_atomically(&target, &bytes)?;
        info!(
            "Downloaded {} ({} bytes) in {}ms",
            file_name,
            bytes.len(),
            started.elapsed().as_millis()
        );
        Ok(target)
    }
}

impl SessionListener for DownloadPipeline {
    fn session_opened(&self, session: Weak<DeviceSession>) {
        *self.session.lock_ignore_poison() = session;
        self.gate.open(self.capacity);
    }

    fn session_closing(&self) {
        self.gate.close();
        if !self.active.wait_idle(self.drain_timeout) {
            warn!(
                "Transfers still running after {}ms, releasing the camera anyway",
                self.drain_timeout.as_millis()
            );
        }
        *self.session.lock_ignore_poison() = Weak::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir();
        if let Some(home) = home {
            assert_eq!(expand_tilde("~/Pictures/a.nef"), home.join("Pictures/a.nef"));
            assert_eq!(expand_tilde("~"), home);
        }
        assert_eq!(expand_tilde("/tmp/a.nef"), PathBuf::from("/tmp/a.nef"));
        assert_eq!(expand_tilde("~user/a.nef"), PathBuf::from("~user/a.nef"));
    }

    #[test]
    fn test_partial_path_appends_suffix() {
        assert_eq!(partial_path(Path::new("/tmp/DSC_0001.NEF")), PathBuf::from("/tmp/DSC_0001.NEF.part"));
    }

    #[test]
    fn test_empty_destination_is_invalid() {
        assert!(matches!(
            resolve_destination("  ", "A.JPG"),
            Err(CameraError::InvalidDestination { .. })
        ));
    }

    #[test]
    fn test_directory_destination_keeps_name() {
        let dir = tempfile::tempdir().unwrap();
        let target = resolve_destination(dir.path().to_str().unwrap(), "A.JPG").unwrap();
        assert_eq!(target, dir.path().join("A.JPG"));
    }

    #[test]
    fn test_write_into_missing_directory_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("A.JPG");
        let err = write_atomically(&target, b"data").unwrap_err();
        assert!(matches!(err, CameraError::Io { .. }));
        assert!(!partial_path(&target).exists());
        assert!(!target.exists());
    }

    #[test]
    fn test_active_work_wait_idle() {
        let active = ActiveWork::default();
        assert!(active.wait_idle(Duration::ZERO));
        let guard = active.enter();
        assert!(!active.wait_idle(Duration::from_millis(10)));
        drop(guard);
        assert!(active.wait_idle(Duration::ZERO));
    }
}
