//! Error types for camera session, catalog and transfer operations.

use std::sync::Mutex;

use crate::camera::driver::DriverError;
use crate::ignore_poison::IgnorePoison;

/// Error types for camera operations.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum CameraError {
    /// No session is open.
    NotConnected,
    /// The driver plugin loader failed to initialize.
    DriverLoad { message: String },
    /// The model name is empty or otherwise unusable.
    InvalidModel { model: String },
    /// No capability profile matches the requested model.
    ModelNotSupported { model: String },
    /// No usable transport endpoint for the requested path.
    EndpointNotFound { path: String },
    /// The device-level session initialization failed.
    HandshakeFailed { message: String },
    /// The device did not answer in time.
    Timeout { operation: String },
    /// A catalog scan is already running.
    ScanInProgress,
    /// All thumbnail slots stayed taken for the whole wait (retryable).
    Busy,
    /// The driver failed to deliver a file.
    Transfer {
        folder: String,
        file: String,
        message: String,
    },
    /// The driver reported success but delivered zero bytes.
    EmptyPayload { folder: String, file: String },
    /// The download destination is empty or unusable.
    InvalidDestination { path: String },
    /// Local filesystem failure while writing a download.
    Io { path: String, message: String },
    /// A disconnect is in progress; no new work is accepted.
    Disconnecting,
    /// A background worker panicked or was dropped before completing.
    WorkerFailed { message: String },
    /// Other error.
    Other { message: String },
}

impl CameraError {
    /// Returns true if the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Busy)
    }

    /// Returns a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotConnected => "No camera is connected. Connect a camera first.".to_string(),
            Self::DriverLoad { .. } => {
                "The camera driver couldn't be loaded. Check the driver search path.".to_string()
            }
            Self::InvalidModel { .. } => "Pick a camera model before connecting.".to_string(),
            Self::ModelNotSupported { model } => format!("The camera model \"{model}\" isn't supported."),
            Self::EndpointNotFound { path } => {
                format!("Couldn't find the camera at {path}. Check that it's on the same network.")
            }
            Self::HandshakeFailed { .. } => {
                "The camera refused the connection. Turn it off and on, then try again.".to_string()
            }
            Self::Timeout { .. } => {
                "The camera took too long to answer. It may be busy or out of range. Try again.".to_string()
            }
            Self::ScanInProgress => "The camera's photos are still being listed.".to_string(),
            Self::Busy => "The camera is busy. Wait a moment and try again.".to_string(),
            Self::Transfer { file, .. } => format!("Couldn't copy {file} from the camera."),
            Self::EmptyPayload { file, .. } => format!("The camera sent an empty file for {file}."),
            Self::InvalidDestination { .. } => "Choose where to save the file.".to_string(),
            Self::Io { path, .. } => format!("Couldn't write to {path}. Check the folder exists and has space."),
            Self::Disconnecting => "The camera is disconnecting.".to_string(),
            Self::WorkerFailed { .. } => "Something went wrong in the background. Try again.".to_string(),
            Self::Other { message } => message.clone(),
        }
    }
}

impl std::fmt::Display for CameraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Camera not connected"),
            Self::DriverLoad { message } => write!(f, "Driver load failed: {message}"),
            Self::InvalidModel { model } => write!(f, "Invalid camera model: '{model}'"),
            Self::ModelNotSupported { model } => write!(f, "Model not supported: {model}"),
            Self::EndpointNotFound { path } => write!(f, "Endpoint not found: {path}"),
            Self::HandshakeFailed { message } => write!(f, "Handshake failed: {message}"),
            Self::Timeout { operation } => write!(f, "Timed out: {operation}"),
            Self::ScanInProgress => write!(f, "Scan already in progress"),
            Self::Busy => write!(f, "Thumbnail slots busy"),
            Self::Transfer { folder, file, message } => {
                write!(f, "Transfer of {folder}/{file} failed: {message}")
            }
            Self::EmptyPayload { folder, file } => write!(f, "Empty payload for {folder}/{file}"),
            Self::InvalidDestination { path } => write!(f, "Invalid destination: '{path}'"),
            Self::Io { path, message } => write!(f, "I/O error at {path}: {message}"),
            Self::Disconnecting => write!(f, "Disconnect in progress"),
            Self::WorkerFailed { message } => write!(f, "Worker failed: {message}"),
            Self::Other { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for CameraError {}

/// Maps driver errors to our error types. `operation` names what was being attempted.
pub(crate) fn map_driver_error(e: DriverError, operation: &str) -> CameraError {
    match e {
        DriverError::Loader(message) => CameraError::DriverLoad { message },
        DriverError::Timeout => CameraError::Timeout {
            operation: operation.to_string(),
        },
        DriverError::Disconnected => CameraError::NotConnected,
        DriverError::NotSupported => CameraError::Other {
            message: format!("{operation}: not supported by this camera"),
        },
        DriverError::NotFound(what) => CameraError::Other {
            message: format!("{operation}: not found: {what}"),
        },
        DriverError::Protocol { code, message } => CameraError::Other {
            message: format!("{operation}: device error {code} ({message})"),
        },
        DriverError::Other(message) => CameraError::Other {
            message: format!("{operation}: {message}"),
        },
    }
}

/// The most recent failure of any camera operation, readable after a `false`/empty result.
#[derive(Debug, Default)]
pub struct LastError(Mutex<Option<CameraError>>);

impl LastError {
    pub fn record(&self, error: &CameraError) {
        *self.0.lock_ignore_poison() = Some(error.clone());
    }

    pub fn get(&self) -> Option<CameraError> {
        self.0.lock_ignore_poison().clone()
    }

    pub fn clear(&self) {
        *self.0.lock_ignore_poison() = None;
    }
}
