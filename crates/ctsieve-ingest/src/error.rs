//! Error types for the ingestion and aggregation jobs.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a run.
#[derive(Error, Debug)]
pub enum Error {
    /// Record schema error.
    #[error(transparent)]
    Core(#[from] ctsieve_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error talking to the ledger.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The ledger returned something unusable.
    #[error("Source error: {0}")]
    Source(String),

    /// Rotated output error.
    #[error("Rotation error: {0}")]
    Rotation(String),

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// The scan ended before covering its range.
    #[error("Scan stopped early: {0}")]
    ScanStopped(String),

    /// A worker thread panicked.
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a [`Error::WorkerPanicked`] from a `JoinHandle::join` payload.
    pub(crate) fn from_panic(name: &str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::WorkerPanicked(format!("{name}: {detail}"))
    }
}
