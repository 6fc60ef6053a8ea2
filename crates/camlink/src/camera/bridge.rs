//! Async bridge between blocking driver work and the caller's completion context.
//!
//! Each request runs in two phases. The worker phase executes the blocking call on tokio's
//! blocking pool. Its typed result (or the panic it raised, converted to an error) is pushed into
//! an unbounded channel. A single dispatcher task drains that channel and invokes each caller's
//! continuation exactly once, in the order results arrive.
//!
//! Each continuation sits in a take-once slot. A bridge that owns its runtime fails whatever is
//! still pending when it is dropped, so no caller is left waiting.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::session::CameraError;
use crate::ignore_poison::IgnorePoison;

/// Identifies one asynchronous request in logs.
pub type Ticket = Uuid;

/// Fails a pending request's continuation, if it hasn't run yet.
type Abort = Box<dyn FnOnce(CameraError) + Send>;

/// A ready-to-run completion: the continuation with its result already bound.
struct Delivery {
    ticket: Ticket,
    label: &'static str,
    run: Box<dyn FnOnce() + Send>,
}

impl Delivery {
    fn deliver(self) {
        debug!("Delivering {} result ({})", self.label, self.ticket);
        if panic::catch_unwind(AssertUnwindSafe(self.run)).is_err() {
            error!("Completion for {} ({}) panicked", self.label, self.ticket);
        }
    }
}

/// Runs blocking camera work off the caller's thread and delivers one result per request.
pub struct AsyncBridge {
    handle: Handle,
    /// Present when the bridge built its own runtime.
    runtime: Option<Runtime>,
    deliveries: mpsc::UnboundedSender<Delivery>,
    pending: Arc<Mutex<HashMap<Ticket, Abort>>>,
}

impl AsyncBridge {
    /// Builds a bridge with its own small runtime.
    pub fn new() -> Result<Self, CameraError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("camlink-bridge")
            .enable_time()
            .build()
            .map_err(|e| CameraError::WorkerFailed {
                message: format!("Couldn't start async runtime: {e}"),
            })?;
        let handle = runtime.handle().clone();
        Ok(Self::build(handle, Some(runtime)))
    }

    /// Builds a bridge on an existing runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self::build(handle, None)
    }

    fn build(handle: Handle, runtime: Option<Runtime>) -> Self {
        let (deliveries, mut inbox) = mpsc::unbounded_channel::<Delivery>();
        handle.spawn(async move {
            while let Some(delivery) = inbox.recv().await {
                delivery.deliver();
            }
            debug!("Completion dispatcher stopped");
        });
        Self {
            handle,
            runtime,
            deliveries,
            pending: Arc::default(),
        }
    }

    /// Requests submitted but not yet delivered.
    pub fn pending(&self) -> usize {
        self.pending.lock_ignore_poison().len()
    }

    /// Runs `work` on a worker thread and hands its result to `completion` exactly once.
    ///
    /// A panic inside `work` is delivered as [`CameraError::WorkerFailed`].
    pub fn submit<T, W, C>(&self, label: &'static str, work: W, completion: C) -> Ticket
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, CameraError> + Send + 'static,
        C: FnOnce(Result<T, CameraError>) + Send + 'static,
    {
        let ticket = Uuid::new_v4();
        debug!("Submitting {} ({})", label, ticket);

        let completion = Arc::new(Mutex::new(Some(completion)));
        let abort_slot = Arc::clone(&completion);
        self.pending.lock_ignore_poison().insert(
            ticket,
            Box::new(move |e: CameraError| {
                let completion = abort_slot.lock_ignore_poison().take();
                if let Some(completion) = completion {
                    completion(Err(e));
                }
            }),
        );

        let deliveries = self.deliveries.clone();
        let pending = Arc::clone(&self.pending);
        let worker = self.handle.spawn_blocking(work);
        self.handle.spawn(async move {
            let result = match worker.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    error!("{} ({}) panicked in the worker", label, ticket);
                    Err(CameraError::WorkerFailed {
                        message: format!("{label} panicked"),
                    })
                }
                Err(e) => Err(CameraError::WorkerFailed {
                    message: format!("{label} was cancelled: {e}"),
                }),
            };
            let delivery = Delivery {
                ticket,
                label,
                run: Box::new(move || {
                    pending.lock_ignore_poison().remove(&ticket);
                    let completion = completion.lock_ignore_poison().take();
                    if let Some(completion) = completion {
                        completion(result);
                    }
                }),
            };
            if let Err(mpsc::error::SendError(delivery)) = deliveries.send(delivery) {
                warn!("Completion dispatcher is gone, delivering {} inline", delivery.label);
                delivery.deliver();
            }
        });
        ticket
    }

    /// Runs `work` on a worker thread and awaits its result.
    pub async fn run<T, W>(&self, work: W) -> Result<T, CameraError>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, CameraError> + Send + 'static,
    {
        match self.handle.spawn_blocking(work).await {
            Ok(result) => result,
            Err(e) => Err(CameraError::WorkerFailed { message: e.to_string() }),
        }
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            // Tasks on a borrowed runtime keep running and deliver on their own.
            return;
        };
        // Doesn't block, so dropping the bridge from async code is fine.
        runtime.shutdown_background();

        let orphans: Vec<(Ticket, Abort)> = self.pending.lock_ignore_poison().drain().collect();
        if !orphans.is_empty() {
            warn!("Async bridge shut down with {} request(s) pending, failing them", orphans.len());
        }
        for (ticket, abort) in orphans {
            let failed = CameraError::WorkerFailed {
                message: "async runtime shut down before the request finished".to_string(),
            };
            if panic::catch_unwind(AssertUnwindSafe(|| abort(failed))).is_err() {
                error!("Completion for request {} panicked during shutdown", ticket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delivers_success_once() {
        let bridge = AsyncBridge::with_handle(Handle::current());
        let (tx, rx) = oneshot::channel();
        bridge.submit("answer", || Ok(42), move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Ok(42));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delivers_error() {
        let bridge = AsyncBridge::with_handle(Handle::current());
        let (tx, rx) = oneshot::channel::<Result<(), CameraError>>();
        bridge.submit("fails", || Err(CameraError::Busy), move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Err(CameraError::Busy));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_panic_becomes_error() {
        let bridge = AsyncBridge::with_handle(Handle::current());
        let (tx, rx) = oneshot::channel::<Result<u8, CameraError>>();
        bridge.submit(
            "explodes",
            || -> Result<u8, CameraError> { panic!("driver fault") },
            move |result| {
                let _ = tx.send(result);
            },
        );
        assert!(matches!(rx.await.unwrap(), Err(CameraError::WorkerFailed { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_request_completes_exactly_once() {
        let bridge = AsyncBridge::with_handle(Handle::current());
        let delivered = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..20u64 {
            let delivered = Arc::clone(&delivered);
            let tx = tx.clone();
            bridge.submit(
                "sleepy",
                move || {
                    std::thread::sleep(Duration::from_millis(20 - i));
                    Ok(i)
                },
                move |result| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(result);
                },
            );
        }
        drop(tx);
        let mut seen = Vec::new();
        while let Some(result) = rx.recv().await {
            seen.push(result.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        assert_eq!(delivered.load(Ordering::SeqCst), 20);
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_completion_does_not_stop_dispatcher() {
        let bridge = AsyncBridge::with_handle(Handle::current());
        bridge.submit("first", || Ok(()), |_| panic!("caller bug"));
        let (tx, rx) = oneshot::channel();
        bridge.submit("second", || Ok(7), move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Ok(7));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_awaits_result() {
        let bridge = AsyncBridge::with_handle(Handle::current());
        assert_eq!(bridge.run(|| Ok("done")).await, Ok("done"));
    }

    #[test]
    fn test_dropping_owned_runtime_fails_pending_requests() {
        let bridge = AsyncBridge::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        bridge.submit(
            "slow",
            || {
                std::thread::sleep(Duration::from_millis(300));
                Ok(1)
            },
            move |result| {
                let _ = tx.send(result);
            },
        );
        assert_eq!(bridge.pending(), 1);
        drop(bridge);

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(first, Err(CameraError::WorkerFailed { .. })));
        // The worker finishing later must not deliver a second time.
        assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());
    }

    #[test]
    fn test_owned_runtime_delivers_to_blocking_caller() {
        let bridge = AsyncBridge::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        bridge.submit("owned", || Ok(5), move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(5));
    }
}
