//! Error types for TinyExchange.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid state transition for record {record_id}: expected one of [{}], found {actual}", .expected.join(", "))]
    InvalidStateTransition {
        record_id: String,
        expected: Vec<String>,
        actual: String,
    },

    #[error("Protocol version mismatch: expected {expected}, found {actual}")]
    ProtocolVersionMismatch { expected: String, actual: String },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("No supported formats")]
    NoSupportedFormats,

    #[error("Negotiation not supported: {0}")]
    NegotiationNotSupported(String),

    #[error("Connection required: {0}")]
    ConnectionRequired(String),

    #[error("Connection not ready: {0}")]
    ConnectionNotReady(String),

    #[error("Error processing attachments: {0}")]
    ErrorProcessingAttachments(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid_state<S: std::fmt::Display>(record_id: &str, expected: &[S], actual: S) -> Self {
        Error::InvalidStateTransition {
            record_id: record_id.to_string(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
            actual: actual.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(format!("sqlite: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = Error::invalid_state("rec-1", &["offer-sent", "proposal-received"], "done");
        assert_eq!(
            err.to_string(),
            "Invalid state transition for record rec-1: expected one of [offer-sent, proposal-received], found done"
        );
    }
}
