//! Error types for the capture pipeline.

use framecap_common::validation::ValidationError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// Invalid parameters or settings. Never retried.
    #[error("Configuration invalid: {0}")]
    Configuration(String),

    /// A temporary surface or worker could not be obtained. Aborts the current tick only.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Encode task for frame {frame_number} failed: {message}")]
    EncodeTask { frame_number: u64, message: String },

    #[error("Encoder stalled: {pending} task(s) still running after {timeout:?}")]
    EncodeStalled { pending: usize, timeout: Duration },

    #[error("External process failed: {0}")]
    ExternalProcess(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

impl CaptureError {
    /// Whether a failed encode attempt may succeed on another try.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::Io(_) | CaptureError::EncodeTask { .. })
    }

    /// Whether the error ends the session rather than a single tick.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CaptureError::ResourceUnavailable(_))
    }
}

impl From<ValidationError> for CaptureError {
    fn from(e: ValidationError) -> Self {
        CaptureError::Configuration(e.to_string())
    }
}

impl From<zip::result::ZipError> for CaptureError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => CaptureError::Io(io),
            zip::result::ZipError::InvalidPassword => {
                CaptureError::Archive("wrong archive key".to_string())
            }
            other => CaptureError::Archive(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for CaptureError {
    fn from(e: tokio::task::JoinError) -> Self {
        CaptureError::InvalidState(format!("Background task failed: {}", e))
    }
}

impl From<CaptureError> for String {
    fn from(e: CaptureError) -> String {
        e.to_string()
    }
}
