//! Directory walk that turns the camera's storage into a photo listing.
//!
//! Cameras lay storage out as `/<storage>/DCIM/<NNNMAKER>/<files>`. We look for the first
//! `DCIM` folder under any storage, descend into its first subfolder (or stay in `DCIM` if it
//! has none) and keep the files whose extension is a known photo format.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use super::cache::ScanCounters;
use crate::camera::session::DeviceSession;
use crate::camera::session::errors::{CameraError, map_driver_error};
use crate::camera::types::FileDescriptor;

/// Photo formats, compared case-insensitively.
pub const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "nef", "cr2", "arw", "dng", "rw2", "orf"];

const MEDIA_ROOT_MARKER: &str = "DCIM";

/// Returns true if `name` has one of [`PHOTO_EXTENSIONS`].
pub fn is_photo(name: &str) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty() && PHOTO_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known))
}

pub(crate) fn join_folder(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// How a walk ended.
#[derive(Debug)]
pub(crate) enum WalkOutcome {
    Completed(Vec<FileDescriptor>),
    Cancelled,
}

pub(crate) struct Walker<'a> {
    session: &'a DeviceSession,
    cancel: &'a AtomicBool,
    counters: &'a ScanCounters,
}

impl<'a> Walker<'a> {
    pub fn new(session: &'a DeviceSession, cancel: &'a AtomicBool, counters: &'a ScanCounters) -> Self {
        Self {
            session,
            cancel,
            counters,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.session.is_closing()
    }

    fn list_folders(&self, folder: &str) -> Result<Vec<String>, CameraError> {
        self.session
            .with_driver(|handle| handle.list_folders(folder))
            .map_err(|e| map_driver_error(e, &format!("list folders in {folder}")))
    }

    /// Finds the first storage folder containing a `DCIM` folder.
    fn media_root(&self) -> Result<Option<String>, CameraError> {
        for storage in self.list_folders("/")? {
            if self.cancelled() {
                return Ok(None);
            }
            let storage_path = join_folder("/", &storage);
            let children = self.list_folders(&storage_path)?;
            if let Some(dcim) = children.iter().find(|name| name.contains(MEDIA_ROOT_MARKER)) {
                return Ok(Some(join_folder(&storage_path, dcim)));
            }
        }
        Ok(None)
    }

    /// Runs the walk. A missing media root is an empty listing, not an error.
    pub fn run(&self) -> Result<WalkOutcome, CameraError> {
        if self.cancelled() {
            return Ok(WalkOutcome::Cancelled);
        }
        let Some(root) = self.media_root()? else {
            if self.cancelled() {
                return Ok(WalkOutcome::Cancelled);
            }
            info!("No {} folder on {}, catalog is empty", MEDIA_ROOT_MARKER, self.session.model());
            return Ok(WalkOutcome::Completed(Vec::new()));
        };
        if self.cancelled() {
            return Ok(WalkOutcome::Cancelled);
        }

        let photo_folder = match self.list_folders(&root)?.first() {
            Some(sub) => join_folder(&root, sub),
            None => root,
        };
        debug!("Listing photos in {}", photo_folder);
        if self.cancelled() {
            return Ok(WalkOutcome::Cancelled);
        }

        let files = self
            .session
            .with_driver(|handle| handle.list_files(&photo_folder))
            .map_err(|e| map_driver_error(e, &format!("list files in {photo_folder}")))?;
        self.counters.set_total(files.len() as u64);

        let mut photos = Vec::new();
        for name in files {
            if self.cancelled() {
                return Ok(WalkOutcome::Cancelled);
            }
            if is_photo(&name) {
                photos.push(FileDescriptor::new(photo_folder.clone(), name));
            }
            self.counters.advance();
        }
        Ok(WalkOutcome::Completed(photos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_photo_case_insensitive() {
        assert!(is_photo("DSC_0001.NEF"));
        assert!(is_photo("img_0001.jpeg"));
        assert!(is_photo("P1000001.RW2"));
        assert!(is_photo("a.b.Orf"));
    }

    #[test]
    fn test_is_photo_rejects_others() {
        assert!(!is_photo("MOV_0001.MP4"));
        assert!(!is_photo("NOTES.TXT"));
        assert!(!is_photo("jpg"));
        assert!(!is_photo(".jpg"));
        assert!(!is_photo("DSC_0001."));
    }

    #[test]
    fn test_cancelled_walk_never_reaches_driver() {
        use crate::camera::session::{LastError, SessionManager};
        use crate::camera::virtual_device::{Fault, VirtualCameraDriver};
        use crate::config::CameraConfig;
        use std::sync::Arc;

        let driver = VirtualCameraDriver::nikon_over_wifi();
        let sessions = SessionManager::new(
            Arc::new(driver.clone()),
            CameraConfig::default(),
            Arc::new(LastError::default()),
        );
        sessions.connect("Nikon Z 6", "ptpip:192.168.1.1:15740").unwrap();
        let session = sessions.session().unwrap();
        // Any listing call would fail the walk instead of cancelling it.
        driver.fail(Fault::ListFolders);

        let cancel = AtomicBool::new(true);
        let counters = ScanCounters::default();
        let outcome = Walker::new(&session, &cancel, &counters).run().unwrap();
        assert!(matches!(outcome, WalkOutcome::Cancelled));
    }

    #[test]
    fn test_join_folder() {
        assert_eq!(join_folder("/", "store_00010001"), "/store_00010001");
        assert_eq!(join_folder("/store_00010001", "DCIM"), "/store_00010001/DCIM");
    }
}
