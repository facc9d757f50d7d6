//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// How the driver reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection problem. Reconnect with backoff from the committed cursor.
    Transport,
    /// Bad record. Skip the event and let the cursor advance.
    Validation,
    /// Optional lookup failed. The record is stored without it.
    Enrichment,
    /// Write failed. The event is not processed and the cursor stays put.
    Persistence,
    /// Startup refused.
    Config,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Validation => "validation",
            Self::Enrichment => "enrichment",
            Self::Persistence => "persistence",
            Self::Config => "config",
        }
    }
}

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Websocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection closed or unusable without a protocol error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP error from an enrichment lookup.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Enrichment failed for a non-HTTP reason.
    #[error("Enrichment error ({step}): {reason}")]
    Enrichment { step: &'static str, reason: String },

    /// Record or envelope rejected.
    #[error("Validation error: {0}")]
    Validation(#[from] rito_core::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error outside record validation.
    #[error("JSON error: {0}")]
    Json(String),
}

impl Error {
    /// Classify the error for the driver.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Database(_) | Self::Io(_) => ErrorClass::Persistence,
            Self::WebSocket(_) | Self::Transport(_) => ErrorClass::Transport,
            Self::Http(_) | Self::Enrichment { .. } => ErrorClass::Enrichment,
            Self::Validation(_) | Self::Json(_) => ErrorClass::Validation,
            Self::Config(_) => ErrorClass::Config,
        }
    }

    pub fn enrichment(step: &'static str, reason: impl Into<String>) -> Self {
        Self::Enrichment {
            step,
            reason: reason.into(),
        }
    }
}
