//! Error taxonomy for the ingestion pipeline.
//!
//! File-level and record-level problems are captured into result objects
//! ([`ParseOutcome`](crate::parser::ParseOutcome),
//! [`ImportResult`](crate::importer::ImportResult)) and never cross their
//! component boundary. [`StoreError`] is the one typed error that does,
//! carrying the importer's retry classification.

use thiserror::Error;

/// Classification of a failure while reading or decoding one manifest file.
///
/// The parser never returns `Err`; every failure is classified into one of
/// these kinds and recorded on the outcome so a caller can process N files
/// without one failure aborting the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// File or parent directory does not exist.
    NotFound,
    /// Invalid UTF-8/JSON content.
    Decode,
    /// Missing read permission.
    Permission,
    /// Read exceeded the per-file timeout.
    Timeout,
    /// File exceeds the size ceiling.
    TooLarge,
    /// A required field is missing, empty, or of the wrong type.
    Structural,
    /// Anything that does not fit the categories above.
    Unknown,
}

impl ParseErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseErrorKind::NotFound => "not-found",
            ParseErrorKind::Decode => "decode-error",
            ParseErrorKind::Permission => "permission",
            ParseErrorKind::Timeout => "timeout",
            ParseErrorKind::TooLarge => "too-large",
            ParseErrorKind::Structural => "structural",
            ParseErrorKind::Unknown => "unknown",
        }
    }

    /// Classify a filesystem error from reading a manifest.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => ParseErrorKind::NotFound,
            ErrorKind::PermissionDenied => ParseErrorKind::Permission,
            ErrorKind::TimedOut => ParseErrorKind::Timeout,
            _ => ParseErrorKind::Unknown,
        }
    }
}

/// An internal, classified parse failure. Converted into a result-level
/// error string by the parser, never propagated.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ParseFailure {
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ParseFailure {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors surfaced by a [`Store`](crate::store::Store) backend.
///
/// The importer's retry policy hangs off this classification: transient
/// errors are retried with backoff, constraint violations abandon the batch
/// immediately, and anything else fails fast.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Uniqueness or foreign-key violation. Never retried.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Connection loss, lock contention, pool exhaustion. Retried with
    /// exponential backoff up to the configured attempt limit.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Any other store failure. Fails fast, no retry.
    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                use sqlx::error::ErrorKind;
                match db.kind() {
                    ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation => StoreError::Constraint(db.message().to_string()),
                    _ => {
                        // SQLITE_BUSY / SQLITE_LOCKED surface as plain
                        // database errors; recognize them by message.
                        let msg = db.message().to_lowercase();
                        if msg.contains("database is locked") || msg.contains("database table is locked")
                        {
                            StoreError::Transient(db.message().to_string())
                        } else {
                            StoreError::Other(db.message().to_string())
                        }
                    }
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
            _ => StoreError::Other(err.to_string()),
        }
    }
}
