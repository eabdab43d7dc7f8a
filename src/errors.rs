use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Structured error types for the bib sorting pipeline.
///
/// Variants carry the context of their domain (file, HTTP status, attempt
/// count) so callers can classify failures without parsing strings. The
/// per-image variants end up inside a `DetectionResult`; only
/// `Configuration`, `Validation` and directory-level `FileSystem` errors
/// abort a run.
#[derive(Error, Debug)]
pub enum BibSortError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unreadable image: {path:?}")]
    UnreadableImage {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Image encoding error: {operation} failed (file: {path:?})")]
    Encoding {
        path: PathBuf,
        operation: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Transient API error{}: {message}", status_suffix(.status))]
    TransientApi { status: Option<u16>, message: String },

    #[error("Fatal API error{}: {message}", status_suffix(.status))]
    FatalApi { status: Option<u16>, message: String },

    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Detection failed for {path:?} after {attempts} attempt(s)")]
    DetectionFailed {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: Box<BibSortError>,
    },

    #[error("Cancelled while processing {path:?}")]
    Cancelled { path: PathBuf },

    #[error("Worker pool error: {operation} failed: {message}")]
    WorkerPool { operation: String, message: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl BibSortError {
    /// Whether a retry has a chance of succeeding.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientApi { .. } | Self::Timeout { .. })
    }

    /// Classify an HTTP status returned by the inference endpoint.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 | 500..=599 => Self::TransientApi {
                status: Some(status),
                message,
            },
            _ => Self::FatalApi {
                status: Some(status),
                message,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, BibSortError>;

/// Convert anyhow errors to configuration errors.
///
/// Only the settings layer sees anyhow errors; everything past it speaks
/// `BibSortError`.
impl From<anyhow::Error> for BibSortError {
    fn from(err: anyhow::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Fallback for I/O errors without a known path. Code that has context
/// should construct `BibSortError::FileSystem` directly.
impl From<std::io::Error> for BibSortError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for BibSortError {
    fn from(err: image::ImageError) -> Self {
        Self::Encoding {
            path: PathBuf::from("unknown"),
            operation: "image processing".to_string(),
            source: err,
        }
    }
}

/// Transport-level reqwest failures.
///
/// Anything that never produced an HTTP status (connect, timeout, broken
/// body) is worth another try. Status codes are classified separately by
/// [`BibSortError::from_status`].
impl From<reqwest::Error> for BibSortError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_builder() {
            return Self::FatalApi {
                status: None,
                message: err.to_string(),
            };
        }
        Self::TransientApi {
            status: None,
            message: err.to_string(),
        }
    }
}
