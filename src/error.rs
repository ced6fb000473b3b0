use std::path::PathBuf;
use thiserror::Error;

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Capture Error: {0}")]
    Capture(#[from] CaptureError),
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Remote Error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Routine file error: {0}")]
    Routines(#[from] serde_json::Error),
    #[error("Pipeline Error: {0}")]
    Pipeline(String),
}

// Frame acquisition errors

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Unable to open capture device {device}: {reason}")]
    DeviceUnavailable { device: i32, reason: String },
    #[error("Camera frame not ready")]
    NotReady,
    #[error("Frame source is closed")]
    Closed,
    #[error("Capture backend failure: {0}")]
    Backend(String),
}

// Calibration loading errors, cached for the process lifetime

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntrinsicsError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("malformed intrinsics: {0}")]
    Malformed(String),
    #[error("failed to read intrinsics: {0}")]
    Io(String),
}

// Remote detector call errors, absorbed by the remote landmark service

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("remote call timed out after {0}ms")]
    Timeout(u64),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote detector returned an error: {0}")]
    Api(String),
    #[error("failed to decode payload: {0}")]
    Decode(String),
}

// Marker detection errors

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectError {
    #[error("{0}")]
    Unavailable(String),
    #[error("marker detection failed: {0}")]
    Backend(String),
}
