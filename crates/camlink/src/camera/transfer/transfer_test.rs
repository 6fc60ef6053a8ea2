//! Download pipeline tests against the in-memory camera.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::camera::session::{LastError, SessionManager};
use crate::camera::types::DownloadProgress;
use crate::camera::virtual_device::{Fault, VirtualCameraDriver};
use crate::config::CameraConfig;

const PATH: &str = "ptpip:192.168.1.1:15740";
const FOLDER: &str = "/store_00010001/DCIM/100NCZ_6";

fn connect_with(driver: &VirtualCameraDriver, config: CameraConfig) -> (SessionManager, Arc<DownloadPipeline>) {
    let pipeline = Arc::new(DownloadPipeline::new(
        config.thumbnail_concurrency,
        config.thumbnail_timeout(),
        config.scan_join_timeout(),
    ));
    let sessions = SessionManager::new(Arc::new(driver.clone()), config, Arc::new(LastError::default()));
    sessions.add_listener(pipeline.clone());
    sessions.connect("Nikon Z 6", PATH).unwrap();
    (sessions, pipeline)
}

fn unserialized() -> CameraConfig {
    CameraConfig {
        serialize_driver_calls: false,
        ..CameraConfig::default()
    }
}

fn fetch_many(pipeline: &Arc<DownloadPipeline>, n: usize) -> Vec<Result<Vec<u8>, CameraError>> {
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let pipeline = Arc::clone(pipeline);
            thread::spawn(move || pipeline.download_thumbnail(FOLDER, "DSC_0001.NEF"))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_thumbnail_returns_preview() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    let (_sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    let bytes = pipeline.download_thumbnail(FOLDER, "DSC_0002.nef").unwrap();
    assert_eq!(bytes, b"preview:DSC_0002.nef".to_vec());
    assert_eq!(pipeline.gate().in_use(), 0);
}

#[test]
fn test_thumbnail_without_session_never_reaches_driver() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    let (sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    sessions.disconnect().unwrap();

    assert_eq!(
        pipeline.download_thumbnail(FOLDER, "DSC_0001.NEF").unwrap_err(),
        CameraError::NotConnected
    );
    assert_eq!(driver.fetch_count(), 0);
    assert!(!pipeline.gate().is_open());
}

#[test]
fn test_concurrency_never_exceeds_capacity() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    driver.set_fetch_latency(Duration::from_millis(150));
    let (_sessions, pipeline) = connect_with(&driver, unserialized());

    let results = fetch_many(&pipeline, 3);
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(driver.max_in_flight(), 2);
    assert_eq!(driver.fetch_count(), 3);
}

#[test]
fn test_extra_request_times_out_as_busy() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    driver.set_fetch_latency(Duration::from_millis(400));
    let config = CameraConfig {
        thumbnail_timeout_ms: 50,
        ..unserialized()
    };
    let (_sessions, pipeline) = connect_with(&driver, config);

    let results = fetch_many(&pipeline, 3);
    let busy: Vec<_> = results.iter().filter(|r| matches!(r, Err(CameraError::Busy))).collect();
    assert_eq!(busy.len(), 1);
    assert!(busy[0].as_ref().unwrap_err().is_retryable());
    assert!(driver.max_in_flight() <= 2);
    assert_eq!(driver.fetch_count(), 2);
}

#[test]
fn test_thumbnail_timeout_can_be_changed() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    let (_sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    pipeline.set_thumbnail_timeout(Duration::from_millis(250));
    assert_eq!(pipeline.thumbnail_timeout(), Duration::from_millis(250));
}

#[test]
fn test_empty_preview_is_an_error() {
    let driver = VirtualCameraDriver::nikon_over_wifi().with_file_and_preview(FOLDER, "BLANK.JPG", vec![1], Vec::new());
    let (_sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    assert_eq!(
        pipeline.download_thumbnail(FOLDER, "BLANK.JPG").unwrap_err(),
        CameraError::EmptyPayload {
            folder: FOLDER.into(),
            file: "BLANK.JPG".into()
        }
    );
    assert_eq!(pipeline.gate().in_use(), 0);
}

#[test]
fn test_driver_failure_releases_slot() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    driver.fail(Fault::GetFile);
    let (_sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    let err = pipeline.download_thumbnail(FOLDER, "DSC_0001.NEF").unwrap_err();
    assert!(matches!(err, CameraError::Transfer { .. }));
    assert_eq!(pipeline.gate().in_use(), 0);
}

#[test]
fn test_full_download_writes_file_and_reports_progress() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    let (_sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("copy.nef");

    let seen: Arc<Mutex<Vec<DownloadProgress>>> = Arc::default();
    let sink_seen = Arc::clone(&seen);
    let written = pipeline
        .download_file(
            FOLDER,
            "DSC_0001.NEF",
            dest.to_str().unwrap(),
            Some(Box::new(move |p| sink_seen.lock().unwrap().push(p))),
        )
        .unwrap();

    assert_eq!(written, dest);
    assert_eq!(fs::read(&dest).unwrap().len(), 300_000);
    assert!(!partial_path(&dest).exists());
    assert!(!driver.progress_sink_installed());

    let seen = seen.lock().unwrap();
    let last = seen.last().unwrap();
    assert_eq!(last.file_name, "DSC_0001.NEF");
    assert_eq!(last.bytes_total, 300_000);
    assert_eq!(last.fraction, 1.0);
    assert!(seen.windows(2).all(|w| w[0].bytes_done <= w[1].bytes_done));
}

#[test]
fn test_full_download_into_directory_keeps_name() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    let (_sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let written = pipeline
        .download_file(FOLDER, "DSC_0003.jpeg", dir.path().to_str().unwrap(), None)
        .unwrap();
    assert_eq!(written, dir.path().join("DSC_0003.jpeg"));
    assert!(written.exists());
}

#[test]
fn test_failed_download_leaves_nothing_and_unregisters_sink() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    driver.fail(Fault::GetFile);
    let (_sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("copy.nef");

    let err = pipeline
        .download_file(FOLDER, "DSC_0001.NEF", dest.to_str().unwrap(), None)
        .unwrap_err();
    assert!(matches!(err, CameraError::Transfer { .. }));
    assert!(!dest.exists());
    assert!(!partial_path(&dest).exists());
    assert!(!driver.progress_sink_installed());
}

#[test]
fn test_download_rejects_empty_destination() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    let (_sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    let err = pipeline.download_file(FOLDER, "DSC_0001.NEF", "", None).unwrap_err();
    assert!(matches!(err, CameraError::InvalidDestination { .. }));
    assert_eq!(driver.fetch_count(), 0);
}

#[test]
fn test_download_missing_file_fails() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    let (_sessions, pipeline) = connect_with(&driver, CameraConfig::default());
    let dir = tempfile::tempdir().unwrap();
    let err = pipeline
        .download_file(FOLDER, "NOPE.NEF", dir.path().join("x").to_str().unwrap(), None)
        .unwrap_err();
    assert!(matches!(err, CameraError::Transfer { .. }));
}

#[test]
fn test_disconnect_waits_for_running_thumbnail() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    driver.set_fetch_latency(Duration::from_millis(250));
    let (sessions, pipeline) = connect_with(&driver, unserialized());

    let worker_pipeline = Arc::clone(&pipeline);
    let fetch = thread::spawn(move || worker_pipeline.download_thumbnail(FOLDER, "DSC_0001.NEF"));
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    sessions.disconnect().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(fetch.join().unwrap().is_ok());
    assert_eq!(driver.live_handles(), 0);
}

#[test]
fn test_concurrent_downloads_report_their_own_progress() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    driver.set_fetch_latency(Duration::from_millis(100));
    let (_sessions, pipeline) = connect_with(&driver, unserialized());
    let dir = tempfile::tempdir().unwrap();

    let handles: Vec<_> = [("DSC_0001.NEF", 300_000u64), ("DSC_0004.ARW", 10_000u64)]
        .into_iter()
        .map(|(name, size)| {
            let pipeline = Arc::clone(&pipeline);
            let dest = dir.path().join(name);
            thread::spawn(move || {
                let totals: Arc<Mutex<Vec<u64>>> = Arc::default();
                let sink_totals = Arc::clone(&totals);
                pipeline
                    .download_file(
                        FOLDER,
                        name,
                        dest.to_str().unwrap(),
                        Some(Box::new(move |p: DownloadProgress| sink_totals.lock().unwrap().push(p.bytes_total))),
                    )
                    .unwrap();
                let totals = totals.lock().unwrap().clone();
                (size, totals)
            })
        })
        .collect();

    for handle in handles {
        let (size, totals) = handle.join().unwrap();
        assert!(!totals.is_empty());
        assert!(totals.iter().all(|&total| total == size), "{size}: {totals:?}");
    }
    assert!(!driver.progress_sink_installed());
}

/// Issues a thumbnail request from inside disconnect, before the pipeline drains.
struct FetchDuringClose {
    pipeline: Arc<DownloadPipeline>,
    result: Mutex<Option<Result<Vec<u8>, CameraError>>>,
}

impl SessionListener for FetchDuringClose {
    fn session_opened(&self, _session: Weak<DeviceSession>) {}

    fn session_closing(&self) {
        *self.result.lock().unwrap() = Some(self.pipeline.download_thumbnail(FOLDER, "DSC_0001.NEF"));
    }
}

#[test]
fn test_thumbnail_refused_once_disconnect_began() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    let config = CameraConfig::default();
    let pipeline = Arc::new(DownloadPipeline::new(
        config.thumbnail_concurrency,
        config.thumbnail_timeout(),
        config.scan_join_timeout(),
    ));
    let intruder = Arc::new(FetchDuringClose {
        pipeline: Arc::clone(&pipeline),
        result: Mutex::new(None),
    });
    let sessions = SessionManager::new(Arc::new(driver.clone()), config, Arc::new(LastError::default()));
    sessions.add_listener(intruder.clone());
    sessions.add_listener(pipeline.clone());
    sessions.connect("Nikon Z 6", PATH).unwrap();

    sessions.disconnect().unwrap();
    assert_eq!(*intruder.result.lock().unwrap(), Some(Err(CameraError::Disconnecting)));
    assert_eq!(driver.fetch_count(), 0);
}

#[test]
fn test_disconnect_releases_gate_waiters_and_waits_for_fetch() {
    let driver = VirtualCameraDriver::nikon_over_wifi();
    driver.set_fetch_latency(Duration::from_millis(300));
    let config = CameraConfig {
        thumbnail_concurrency: 1,
        ..unserialized()
    };
    let (sessions, pipeline) = connect_with(&driver, config);

    let fetches: Vec<_> = ["DSC_0001.NEF", "DSC_0001.JPG"]
        .into_iter()
        .map(|name| {
            let pipeline = Arc::clone(&pipeline);
            let fetch = thread::spawn(move || pipeline.download_thumbnail(FOLDER, name));
            thread::sleep(Duration::from_millis(30));
            fetch
        })
        .collect();

    sessions.disconnect().unwrap();
    assert_eq!(driver.exits_while_busy(), 0);

    let results: Vec<_> = fetches.into_iter().map(|f| f.join().unwrap()).collect();
    assert!(results[0].is_ok());
    assert_eq!(results[1], Err(CameraError::NotConnected));
    assert_eq!(driver.fetch_count(), 1);
}
