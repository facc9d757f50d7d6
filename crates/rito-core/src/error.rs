//! Error types for envelope parsing and record validation.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding or validating firehose data.
#[derive(Error, Debug)]
pub enum Error {
    /// A required field is absent from the record payload.
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// A field is present but malformed (e.g., unparseable timestamp).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// An AT-URI could not be parsed.
    #[error("invalid AT-URI '{0}'")]
    InvalidUri(String),

    /// The collection has no validator registered.
    #[error("unsupported collection: {0}")]
    UnsupportedCollection(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Short, low-cardinality label used for rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
            Self::InvalidUri(_) => "invalid_uri",
            Self::UnsupportedCollection(_) => "unsupported_collection",
            Self::Json(_) => "json",
        }
    }
}
