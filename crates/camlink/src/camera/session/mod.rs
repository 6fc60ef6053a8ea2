//! Camera session lifecycle.
//!
//! Exactly one [`DeviceSession`] exists at a time. [`SessionManager`] owns it and walks it through
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`. A failed connect
//! releases whatever it acquired and lands back in `Disconnected` with the reason recorded.
//!
//! Dependent components register as [`SessionListener`]s. They get a non-owning reference to the
//! session when it opens and are asked to drain their work before the handle is released.

pub mod errors;
pub mod port;


use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use uuid::Uuid;

use super::driver::{CameraAbilities, CameraDriver, CameraHandle, DriverError};
use super::types::{ConnectionStatus, ConnectionType, SessionState};
use crate::config::CameraConfig;
use crate::ignore_poison::IgnorePoison;
pub use errors::{CameraError, LastError};
use errors::map_driver_error;

/// Brands whose cameras are known to speak PTP/IP. Others are allowed but logged.
const KNOWN_BRANDS: &[&str] = &["Nikon", "Canon", "Sony", "Fujifilm", "Olympus", "Panasonic", "Pentax"];

/// A live connection to one camera.
pub struct DeviceSession {
    id: Uuid,
    handle: Arc<dyn CameraHandle>,
    /// Held around every driver call when the transport isn't reentrant.
    driver_lock: Option<Mutex<()>>,
    model: String,
    port_path: String,
    connected_at: DateTime<Utc>,
    connection_time: Duration,
    closing: AtomicBool,
}

impl DeviceSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    /// True once a disconnect has begun. No new driver work should start.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Runs `f` against the device handle, serialized with other driver calls if configured.
    pub fn with_driver<T>(&self, f: impl FnOnce(&dyn CameraHandle) -> T) -> T {
        let _guard = self.driver_lock.as_ref().map(|lock| lock.lock_ignore_poison());
        f(self.handle.as_ref())
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("port_path", &self.port_path)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Components that depend on the session's lifetime.
pub trait SessionListener: Send + Sync {
    /// A session is now connected. The reference is valid until `session_closing` returns.
    fn session_opened(&self, session: Weak<DeviceSession>);

    /// The session is about to be released. Implementations must stop and drain their work.
    fn session_closing(&self);
}

/// Owns the single camera session.
pub struct SessionManager {
    driver: Arc<dyn CameraDriver>,
    config: CameraConfig,
    search_path: Mutex<Option<PathBuf>>,
    state: AtomicU8,
    session: Mutex<Option<Arc<DeviceSession>>>,
    /// Serializes connect and disconnect against each other.
    lifecycle: Mutex<()>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    last_error: Arc<LastError>,
}

impl SessionManager {
    pub fn new(driver: Arc<dyn CameraDriver>, config: CameraConfig, last_error: Arc<LastError>) -> Self {
        let search_path = config.driver_search_path.clone();
        Self {
            driver,
            config,
            search_path: Mutex::new(search_path),
            state: AtomicU8::new(SessionState::Disconnected as u8),
            session: Mutex::new(None),
            lifecycle: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            last_error,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.lock_ignore_poison().push(listener);
    }

    pub fn driver(&self) -> &Arc<dyn CameraDriver> {
        &self.driver
    }

    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        let previous = SessionState::from(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!("Session state: {:?} -> {:?}", previous, state);
        }
    }

    pub fn set_driver_search_path(&self, path: PathBuf) {
        info!("Driver search path set to {}", path.display());
        *self.search_path.lock_ignore_poison() = Some(path);
    }

    pub fn driver_search_path(&self) -> Option<PathBuf> {
        self.search_path.lock_ignore_poison().clone()
    }

    /// The live session, only while connected.
    ///
    /// Returns `Disconnecting` once teardown has started so new work is refused.
    pub fn session(&self) -> Result<Arc<DeviceSession>, CameraError> {
        match self.state() {
            SessionState::Connected => {}
            SessionState::Disconnecting => return Err(CameraError::Disconnecting),
            _ => return Err(CameraError::NotConnected),
        }
        let session = self.session.lock_ignore_poison().clone();
        match session {
            Some(session) if !session.is_closing() => Ok(session),
            Some(_) => Err(CameraError::Disconnecting),
            None => Err(CameraError::NotConnected),
        }
    }

    /// Connects to `model` at `path` with the regular handshake timeout.
    pub fn connect(&self, model: &str, path: &str) -> Result<(), CameraError> {
        self.connect_with_timeout(model, path, self.config.connect_timeout())
    }

    /// Connects to `model` through the camera's own Wi-Fi access point.
    pub fn connect_access_point(&self, model: &str, address: &str, port: u16) -> Result<(), CameraError> {
        let path = port::access_point_path(address, port);
        self.connect_with_timeout(model, &path, self.config.access_point_timeout())
    }

    /// Tears down any existing session, then runs the connect sequence.
    pub fn connect_with_timeout(&self, model: &str, path: &str, timeout: Duration) -> Result<(), CameraError> {
        let _lifecycle = self.lifecycle.lock_ignore_poison();
        self.teardown_locked();

        self.set_state(SessionState::Connecting);
        let started = Instant::now();
        match self.open_session(model, path, timeout) {
            Ok((handle, port_path)) => {
                let session = Arc::new(DeviceSession {
                    id: Uuid::new_v4(),
                    handle,
                    driver_lock: self.config.serialize_driver_calls.then(|| Mutex::new(())),
                    model: model.trim().to_string(),
                    port_path,
                    connected_at: Utc::now(),
                    connection_time: started.elapsed(),
                    closing: AtomicBool::new(false),
                });
                info!(
                    "Camera connected: {} at {} in {}ms (session {})",
                    session.model,
                    session.port_path,
                    session.connection_time.as_millis(),
                    session.id
                );
                *self.session.lock_ignore_poison() = Some(Arc::clone(&session));
                self.set_state(SessionState::Connected);
                self.last_error.clear();

                let listeners = self.listeners.lock_ignore_poison().clone();
                for listener in listeners {
                    listener.session_opened(Arc::downgrade(&session));
                }
                Ok(())
            }
            Err(e) => {
                error!("Connect to '{}' at '{}' failed: {}", model, path, e);
                self.set_state(SessionState::Disconnected);
                self.last_error.record(&e);
                Err(e)
            }
        }
    }

    /// The connect steps, in order. Anything acquired is released on failure.
    fn open_session(
        &self,
        model: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<(Arc<dyn CameraHandle>, String), CameraError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(CameraError::InvalidModel {
                model: model.to_string(),
            });
        }
        if !KNOWN_BRANDS.iter().any(|brand| model.starts_with(brand)) {
            warn!("Camera model '{}' isn't from a known PTP/IP brand, trying anyway", model);
        }

        let search_path = self.driver_search_path();
        debug!("Initializing driver loader (search path: {:?})", search_path);
        self.driver
            .init_loader(search_path.as_deref())
            .map_err(|e| map_driver_error(e, "init_loader"))?;

        let abilities = self.resolve_model(model)?;

        let path = port::normalize_path(path);
        if let Some(address) = port::parse_ptpip(&path) {
            debug!("PTP/IP endpoint {}:{}", address.host, address.port);
        }
        let ports = self.driver.ports().map_err(|e| map_driver_error(e, "list ports"))?;
        let port_info = port::resolve_port(&ports, &path).ok_or_else(|| CameraError::EndpointNotFound {
            path: path.clone(),
        })?;
        if port_info.path != path {
            warn!("No endpoint matches '{}', using {} endpoint '{}'", path, port_info.kind.label(), port_info.path);
        }

        let handle = self
            .driver
            .bind(&abilities, &port_info)
            .map_err(|e| map_driver_error(e, "bind"))?;

        debug!("Handshake with {} at {} (timeout {}ms)", model, port_info.path, timeout.as_millis());
        handshake(Arc::clone(&handle), timeout)?;
        Ok((handle, port_info.path))
    }

    fn resolve_model(&self, model: &str) -> Result<CameraAbilities, CameraError> {
        let abilities = self
            .driver
            .abilities()
            .map_err(|e| map_driver_error(e, "list abilities"))?;
        abilities
            .iter()
            .find(|a| a.model == model)
            .or_else(|| abilities.iter().find(|a| a.model.eq_ignore_ascii_case(model)))
            .cloned()
            .ok_or_else(|| CameraError::ModelNotSupported {
                model: model.to_string(),
            })
    }

    /// Drains dependent work and releases the session. Always succeeds once no handle remains.
    pub fn disconnect(&self) -> Result<(), CameraError> {
        let _lifecycle = self.lifecycle.lock_ignore_poison();
        self.teardown_locked();
        Ok(())
    }

    /// Caller must hold `lifecycle`.
    fn teardown_locked(&self) {
        let Some(session) = self.session.lock_ignore_poison().clone() else {
            self.set_state(SessionState::Disconnected);
            return;
        };

        info!("Disconnecting camera {} (session {})", session.model, session.id);
        self.set_state(SessionState::Disconnecting);
        session.closing.store(true, Ordering::SeqCst);

        let listeners = self.listeners.lock_ignore_poison().clone();
        for listener in listeners {
            listener.session_closing();
        }

        session.with_driver(|handle| {
            handle.set_progress_sink(None);
            if let Err(e) = handle.exit() {
                warn!("Camera exit failed for session {}: {}", session.id, e);
            }
        });
        *self.session.lock_ignore_poison() = None;
        self.set_state(SessionState::Disconnected);
        info!("Camera disconnected (session {})", session.id);
    }

    /// Tears the session down only if it is still the one with `id`. A connect that slipped in
    /// after a failed probe keeps its new session.
    fn disconnect_if_current(&self, id: Uuid) {
        let _lifecycle = self.lifecycle.lock_ignore_poison();
        let current = self.session.lock_ignore_poison().as_ref().map(|session| session.id);
        if current == Some(id) {
            self.teardown_locked();
        } else {
            debug!("Session {} already replaced, nothing to tear down", id);
        }
    }

    /// Checks the session is really alive with one cheap round-trip.
    ///
    /// A failed probe tears the session down, so a camera that was switched off stops
    /// looking connected.
    pub fn is_connected(&self) -> bool {
        let Ok(session) = self.session() else {
            return false;
        };
        match session.with_driver(|handle| handle.probe()) {
            Ok(()) | Err(DriverError::NotSupported) => true,
            Err(e) => {
                warn!("Camera {} stopped answering: {}", session.model, e);
                self.last_error.record(&map_driver_error(e, "probe"));
                self.disconnect_if_current(session.id);
                false
            }
        }
    }

    /// Snapshot of connection details. Doesn't touch the device.
    pub fn status(&self) -> ConnectionStatus {
        let state = self.state();
        let session = self.session.lock_ignore_poison().clone();
        let last_error = self.last_error.get().map(|e| e.to_string());
        match session {
            Some(session) => ConnectionStatus {
                is_connected: state == SessionState::Connected,
                is_ready: state == SessionState::Connected && !session.is_closing(),
                camera_model: Some(session.model.clone()),
                port_path: Some(session.port_path.clone()),
                connection_type: ConnectionType::from_path(&session.port_path),
                connection_time_ms: Some(session.connection_time.as_millis() as u64),
                connected_at: Some(session.connected_at.to_rfc3339()),
                last_error,
            },
            None => ConnectionStatus {
                is_connected: false,
                is_ready: false,
                camera_model: None,
                port_path: None,
                connection_type: ConnectionType::Unknown,
                connection_time_ms: None,
                connected_at: None,
                last_error,
            },
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if self.session.lock_ignore_poison().is_some() {
            debug!("Session manager dropped while connected, releasing camera");
            let _ = self.disconnect();
        }
    }
}

/// Runs the device handshake on a helper thread so a silent camera can't block forever.
///
/// On timeout the helper is abandoned. When its call eventually returns it exits the handle
/// itself, since nobody else holds it any more.
fn handshake(handle: Arc<dyn CameraHandle>, timeout: Duration) -> Result<(), CameraError> {
    let (tx, rx) = mpsc::channel();
    // Set under the lock by the caller on timeout; the helper sends under the same lock.
    let abandoned = Arc::new(Mutex::new(false));
    let worker_handle = Arc::clone(&handle);
    let worker_abandoned = Arc::clone(&abandoned);
    let spawned = thread::Builder::new()
        .name("camera-handshake".to_string())
        .spawn(move || {
            let result = worker_handle.init();
            let abandoned = worker_abandoned.lock_ignore_poison();
            if *abandoned {
                debug!("Late handshake finished after connect gave up, releasing handle");
                let _ = worker_handle.exit();
            } else {
                let _ = tx.send(result);
            }
        });
    if let Err(e) = spawned {
        let _ = handle.exit();
        return Err(CameraError::Other {
            message: format!("Couldn't start handshake thread: {e}"),
        });
    }

    let result = match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            let mut abandoned = abandoned.lock_ignore_poison();
            match rx.try_recv() {
                // Finished between the timeout and taking the lock.
                Ok(result) => result,
                Err(_) => {
                    *abandoned = true;
                    warn!("Handshake didn't finish within {}ms, abandoning it", timeout.as_millis());
                    return Err(CameraError::Timeout {
                        operation: "handshake".to_string(),
                    });
                }
            }
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(DriverError::Other(
            "handshake worker exited without a result".to_string(),
        )),
    };

    result.map_err(|e| {
        let _ = handle.exit();
        match e {
            DriverError::Timeout => CameraError::Timeout {
                operation: "handshake".to_string(),
            },
            other => CameraError::HandshakeFailed {
                message: other.to_string(),
            },
        }
    })
}
