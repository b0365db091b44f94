//! Error types for the ingestion server.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. The HTTP layer maps these variants to status
//! codes and short text bodies (see [`crate::http::error_to_response`]).

/// Unified error type for all ingestion operations.
///
/// Each variant represents a distinct failure mode. The HTTP layer maps variants
/// to status codes:
///
/// - `MalformedFrame` -> `400`
/// - `SizeMismatch` -> `400`
/// - `MissingAttribute` -> `400 Missing headers`
/// - `InvalidAttribute` -> `400 Bad request`
/// - `UnknownRecordingKind` -> `400 Unknown file type`
/// - `InvalidRecordingName` -> `400`
/// - `Storage` -> `500`
/// - `CorruptLog` -> `500`
/// - `WriterClosed` -> `500`
///
/// A duplicate batch is not an error; it is reported as
/// [`Receipt::Duplicate`](crate::receipt::Receipt::Duplicate).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A header or field of the frame is structurally invalid.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The payload length is inconsistent with the declared batch geometry.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Number of bytes the declared geometry requires.
        expected: usize,
        /// Number of bytes actually supplied.
        actual: usize,
    },

    /// The boundary did not supply a required attribute.
    #[error("missing attribute: {0}")]
    MissingAttribute(&'static str),

    /// The boundary supplied an attribute that could not be parsed.
    #[error("invalid attribute {name}: {detail}")]
    InvalidAttribute {
        /// Name of the offending attribute.
        name: &'static str,
        /// Why the value was rejected.
        detail: String,
    },

    /// The recording name matches neither the heart-rate nor the motion convention.
    #[error("unknown recording kind: {0}")]
    UnknownRecordingKind(String),

    /// The recording name cannot be used as a file name.
    #[error("invalid recording name: {0:?}")]
    InvalidRecordingName(String),

    /// An append, read, or rewrite of a recording log failed.
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    /// A persisted log line could not be parsed during normalization.
    #[error("corrupt log line {line}: {detail}")]
    CorruptLog {
        /// One-based line number within the log.
        line: usize,
        /// Human-readable description of the problem.
        detail: String,
    },

    /// The writer task has shut down and can no longer accept requests.
    #[error("writer task closed")]
    WriterClosed,
}

impl Error {
    /// Whether this error was caused by the client's request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_)
                | Error::SizeMismatch { .. }
                | Error::MissingAttribute(_)
                | Error::InvalidAttribute { .. }
                | Error::UnknownRecordingKind(_)
                | Error::InvalidRecordingName(_)
        )
    }

    /// Short, stable label used for the `reason` metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::MalformedFrame(_) => "malformed_frame",
            Error::SizeMismatch { .. } => "size_mismatch",
            Error::MissingAttribute(_) => "missing_attribute",
            Error::InvalidAttribute { .. } => "invalid_attribute",
            Error::UnknownRecordingKind(_) => "unknown_kind",
            Error::InvalidRecordingName(_) => "invalid_name",
            Error::Storage(_) => "storage",
            Error::CorruptLog { .. } => "corrupt_log",
            Error::WriterClosed => "writer_closed",
        }
    }
}
