//! Error types for the labelwatch core types.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or validating core types.
#[derive(Error, Debug)]
pub enum Error {
    /// An AT-URI could not be parsed.
    #[error("invalid AT-URI '{uri}': {reason}")]
    InvalidUri {
        /// The URI as received.
        uri: String,
        /// Description of what's wrong.
        reason: &'static str,
    },

    /// A DID does not have the `did:<method>:<id>` shape.
    #[error("invalid DID '{0}'")]
    InvalidDid(String),

    /// A field has an invalid format.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
