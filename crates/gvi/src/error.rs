use std::path::PathBuf;
use thiserror::Error;

/// Fatal precondition failures. Returned from constructors and loaders before
/// any point is processed; nothing else aborts a run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("image directory {0} does not exist or is not a directory")]
    MissingImageDir(PathBuf),

    #[error("no geotagged images found in {0}")]
    NoUsableImages(PathBuf),

    #[error("remote image source requires an access token")]
    MissingAccessToken,

    #[error("invalid H3 resolution {0}, expected 0..=15")]
    InvalidResolution(u8),

    #[error("malformed input {path}: {reason}")]
    MalformedInput { path: PathBuf, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Per-point failure recorded in an `AssignmentResult`. Never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointError {
    /// Search or retrieval failed permanently or exhausted its retry budget.
    #[error("NetworkError: {0}")]
    Network(String),

    /// Retrieved bytes could not be written to the image cache.
    #[error("StorageError: {0}")]
    Storage(String),

    /// The worker handling this point panicked.
    #[error("InternalError: {0}")]
    Internal(String),
}

impl PointError {
    /// Short kind label, written to the `error` output field and used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            PointError::Network(_) => "NetworkError",
            PointError::Storage(_) => "StorageError",
            PointError::Internal(_) => "InternalError",
        }
    }
}

/// Why an image could not be scored. Scoring fails softly, so this ends up as
/// an empty score plus a log line.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("image {0} has no pixels")]
    EmptyImage(PathBuf),

    #[error("segmentation failed: {0}")]
    Segmentation(String),

    #[error("scoring panicked: {0}")]
    Panicked(String),
}

/// Best-effort message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
