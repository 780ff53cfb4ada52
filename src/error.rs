//! Error types for the PCM stream client
//!
//! Every variant's `Display` text doubles as the status line shown to the user,
//! so each failure kind reads differently.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another operation is in progress: {0}")]
    Busy(&'static str),

    #[error("Background task panicked: {0}")]
    TaskPanicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Could not resolve {0}")]
    AddressResolution(String),

    #[error("Invalid connect timeout: {0:?}")]
    InvalidTimeout(std::time::Duration),
}

/// Capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost after {received} bytes: {source}")]
    TransportRead {
        received: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Recording timed out ({received} of {expected} bytes received)")]
    Timeout { received: usize, expected: usize },

    #[error("Buffer too small: capacity {capacity}, requested {requested}")]
    BufferTooSmall { capacity: usize, requested: usize },
}

/// Playback errors
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Nothing recorded yet")]
    NoRecording,

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("Playback of {requested} bytes exceeds buffer capacity {capacity}")]
    OutOfRange { capacity: usize, requested: usize },

    #[error("Playback failed: {0}")]
    Device(#[from] AudioError),
}

/// Audio output device errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Device is not started")]
    NotStarted,

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Recording persistence errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
