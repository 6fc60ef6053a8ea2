//! Photo catalog: background scan, cache, and paged reads.
//!
//! One scan runs at a time on a dedicated `catalog-scanner` thread. It checks a cancel flag
//! between driver calls and after every file, and publishes its listing in one lock
//! acquisition when it finishes. A cancelled or failed scan publishes nothing.
//!
//! Every scan carries a generation number. `clear_cache` and disconnect bump it, so a scan that
//! was started before either can finish but never overwrite the newer state.

pub mod cache;
pub mod walker;


use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::session::{CameraError, DeviceSession, SessionListener};
use super::types::{FileDescriptor, ScanProgress, ScanState};
use super::transfer::ActiveWork;
use crate::ignore_poison::IgnorePoison;
use cache::{CatalogCache, ScanCounters};
use walker::{WalkOutcome, Walker};

/// State guarded by one lock. `scan_state` and `cached` mirror parts of it for lock-free reads
/// and are only written while it is held.
#[derive(Default)]
struct Guarded {
    cache: CatalogCache,
    generation: u64,
    failure: Option<String>,
    cancel: Arc<AtomicBool>,
}

struct Shared {
    guarded: Mutex<Guarded>,
    /// Notified whenever a scan leaves `Scanning`.
    settled: Condvar,
    scan_state: AtomicU8,
    cached: AtomicBool,
    counters: ScanCounters,
}

impl Shared {
    fn set_state(&self, state: ScanState) {
        self.scan_state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> ScanState {
        ScanState::from(self.scan_state.load(Ordering::SeqCst))
    }

    /// Records a walk's outcome, unless a newer generation has taken over.
    fn finish(&self, generation: u64, outcome: Result<WalkOutcome, CameraError>) {
        let mut guarded = self.guarded.lock_ignore_poison();
        if guarded.generation != generation {
            debug!(
                "Discarding scan generation {} (current is {})",
                generation, guarded.generation
            );
            return;
        }
        match outcome {
            Ok(WalkOutcome::Completed(entries)) => {
                info!("Catalog scan complete: {} photos", entries.len());
                guarded.cache.publish(entries);
                guarded.failure = None;
                self.cached.store(true, Ordering::SeqCst);
                self.set_state(ScanState::Complete);
            }
            Ok(WalkOutcome::Cancelled) => {
                info!("Catalog scan cancelled");
                self.set_state(ScanState::Cancelled);
            }
            Err(e) => {
                error!("Catalog scan failed: {}", e);
                guarded.failure = Some(e.to_string());
                self.set_state(ScanState::Failed);
            }
        }
        drop(guarded);
        self.settled.notify_all();
    }
}

/// A running scan thread.
struct ScanWorker {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    /// Disconnects when the thread exits, even on panic.
    done: mpsc::Receiver<()>,
}

impl ScanWorker {
    /// Waits up to `timeout` for the thread to exit. Returns false if it had to be abandoned.
    fn join(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    warn!("Catalog scanner thread panicked");
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }

    fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Builds and serves the photo catalog for the current session.
pub struct CatalogBuilder {
    shared: Arc<Shared>,
    session: Mutex<Weak<DeviceSession>>,
    /// Scanner threads not joined yet. A scan replaced after `clear_cache` stays here until it exits.
    workers: Mutex<Vec<ScanWorker>>,
    /// Scans running on a caller's thread.
    inline: ActiveWork,
    join_timeout: Duration,
}

impl CatalogBuilder {
    pub fn new(join_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                guarded: Mutex::new(Guarded::default()),
                settled: Condvar::new(),
                scan_state: AtomicU8::new(ScanState::Idle as u8),
                cached: AtomicBool::new(false),
                counters: ScanCounters::default(),
            }),
            session: Mutex::new(Weak::new()),
            workers: Mutex::new(Vec::new()),
            inline: ActiveWork::default(),
            join_timeout,
        }
    }

    fn live_session(&self) -> Result<Arc<DeviceSession>, CameraError> {
        match self.session.lock_ignore_poison().upgrade() {
            Some(session) if !session.is_closing() => Ok(session),
            Some(_) => Err(CameraError::Disconnecting),
            None => Err(CameraError::NotConnected),
        }
    }

    /// Moves to `Scanning` and hands back the new generation and cancel flag.
    fn begin(&self) -> Result<(u64, Arc<AtomicBool>), CameraError> {
        let mut guarded = self.shared.guarded.lock_ignore_poison();
        if self.shared.state() == ScanState::Scanning {
            return Err(CameraError::ScanInProgress);
        }
        guarded.generation += 1;
        guarded.failure = None;
        guarded.cancel = Arc::new(AtomicBool::new(false));
        self.shared.counters.reset();
        self.shared.set_state(ScanState::Scanning);
        Ok((guarded.generation, Arc::clone(&guarded.cancel)))
    }

    /// Starts a background scan. Doesn't block.
    pub fn start_scan(&self) -> Result<(), CameraError> {
        // Held until the new worker is registered, so `drain` either sees it or we see the
        // session closing.
        let mut workers = self.workers.lock_ignore_poison();
        let session = self.live_session()?;
        let (generation, cancel) = self.begin()?;

        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut *workers)
            .into_iter()
            .partition(ScanWorker::is_finished);
        for worker in finished {
            worker.join(Duration::ZERO);
        }
        if !running.is_empty() {
            debug!("{} earlier scanner thread(s) still winding down", running.len());
        }
        *workers = running;

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let worker_cancel = Arc::clone(&cancel);
        let spawned = thread::Builder::new()
            .name("catalog-scanner".to_string())
            .spawn(move || {
                let _done = done_tx;
                info!("Catalog scan started on {} (generation {})", session.model(), generation);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    Walker::new(&session, &worker_cancel, &shared.counters).run()
                }))
                .unwrap_or_else(|_| {
                    Err(CameraError::WorkerFailed {
                        message: "catalog scanner panicked".to_string(),
                    })
                });
                shared.finish(generation, outcome);
            });

        match spawned {
            Ok(thread) => {
                workers.push(ScanWorker {
                    cancel,
                    thread,
                    done: done_rx,
                });
                Ok(())
            }
            Err(e) => {
                let err = CameraError::WorkerFailed {
                    message: format!("Couldn't start scanner thread: {e}"),
                };
                self.shared.finish(generation, Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Runs a scan on the calling thread. Waits for a background scan instead if one is running.
    pub fn scan_blocking(&self) -> Result<(), CameraError> {
        {
            let guarded = self.shared.guarded.lock_ignore_poison();
            if self.shared.state() == ScanState::Scanning {
                debug!("Waiting for the running catalog scan");
                let _settled = self
                    .shared
                    .settled
                    .wait_while(guarded, |_| self.shared.state() == ScanState::Scanning)
                    .unwrap_or_else(|e| e.into_inner());
                return match self.shared.state() {
                    ScanState::Complete => Ok(()),
                    _ => Err(self.scan_error()),
                };
            }
        }

        let _inline = self.inline.enter();
        let session = self.live_session()?;
        let (generation, cancel) = self.begin()?;
        info!("Catalog scan running inline on {}", session.model());
        let outcome = Walker::new(&session, &cancel, &self.shared.counters).run();
        self.shared.finish(generation, outcome);
        match self.shared.state() {
            ScanState::Complete => Ok(()),
            _ => Err(self.scan_error()),
        }
    }

    fn scan_error(&self) -> CameraError {
        match self.scan_failure() {
            Some(message) => CameraError::Other { message },
            None => CameraError::Other {
                message: "Catalog scan didn't complete".to_string(),
            },
        }
    }

    /// Asks the running scan to stop. Doesn't wait for it.
    pub fn cancel_scan(&self) {
        let guarded = self.shared.guarded.lock_ignore_poison();
        if self.shared.state() == ScanState::Scanning {
            debug!("Cancelling catalog scan (generation {})", guarded.generation);
            guarded.cancel.store(true, Ordering::SeqCst);
        }
    }

    pub fn scan_state(&self) -> ScanState {
        self.shared.state()
    }

    pub fn is_scan_complete(&self) -> bool {
        self.shared.state() == ScanState::Complete
    }

    /// Why the last scan failed, if it did.
    pub fn scan_failure(&self) -> Option<String> {
        self.shared.guarded.lock_ignore_poison().failure.clone()
    }

    /// Instantaneous snapshot. Never blocks.
    pub fn progress(&self) -> ScanProgress {
        let (current, total) = self.shared.counters.snapshot();
        let state = self.shared.state();
        ScanProgress {
            current,
            total,
            cached: self.shared.cached.load(Ordering::SeqCst),
            scanning: state == ScanState::Scanning,
            state,
        }
    }

    /// Number of cached photos. When nothing has been scanned yet this starts a background
    /// scan and returns 0; poll again once it completes.
    pub fn photo_total_count(&self) -> usize {
        match self.shared.state() {
            ScanState::Complete => self.shared.guarded.lock_ignore_poison().cache.len(),
            ScanState::Idle => {
                if let Err(e) = self.start_scan() {
                    debug!("Couldn't start catalog scan for count: {}", e);
                }
                0
            }
            _ => 0,
        }
    }

    /// One page of the catalog. Scans inline (blocking the caller) if the catalog isn't complete.
    pub fn photo_page(&self, page_index: usize, page_size: usize) -> Result<Vec<FileDescriptor>, CameraError> {
        if self.shared.state() != ScanState::Complete {
            self.scan_blocking()?;
        }
        Ok(self.shared.guarded.lock_ignore_poison().cache.page(page_index, page_size))
    }

    /// Drops the cached listing and returns to `Idle`. A scan in flight is cancelled and its
    /// result discarded.
    pub fn clear_cache(&self) {
        let mut guarded = self.shared.guarded.lock_ignore_poison();
        guarded.generation += 1;
        guarded.cancel.store(true, Ordering::SeqCst);
        guarded.cache.clear();
        guarded.failure = None;
        self.shared.cached.store(false, Ordering::SeqCst);
        self.shared.counters.reset();
        self.shared.set_state(ScanState::Idle);
        drop(guarded);
        self.shared.settled.notify_all();
        debug!("Catalog cache cleared");
    }

    /// Cancels every scan and waits for them to exit, all within one join timeout.
    fn drain(&self) {
        let workers = std::mem::take(&mut *self.workers.lock_ignore_poison());
        for worker in &workers {
            worker.cancel.store(true, Ordering::SeqCst);
        }
        let deadline = Instant::now() + self.join_timeout;
        for worker in workers {
            if !worker.join(deadline.saturating_duration_since(Instant::now())) {
                warn!(
                    "Catalog scanner didn't stop within {}ms, abandoning it",
                    self.join_timeout.as_millis()
                );
            }
        }
        if !self.inline.wait_idle(deadline.saturating_duration_since(Instant::now())) {
            warn!("Inline catalog scan still running after {}ms", self.join_timeout.as_millis());
        }
    }
}

impl SessionListener for CatalogBuilder {
    fn session_opened(&self, session: Weak<DeviceSession>) {
        self.clear_cache();
        *self.session.lock_ignore_poison() = session;
    }

    fn session_closing(&self) {
        self.drain();
        self.clear_cache();
        *self.session.lock_ignore_poison() = Weak::new();
    }
}

impl Drop for CatalogBuilder {
    fn drop(&mut self) {
        self.drain();
    }
}
