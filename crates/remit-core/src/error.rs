//! Error types for Remit
//!
//! `Error` covers failures that stop an operation: storage, I/O, collaborator
//! calls, malformed batch input. Problems with a single record are not errors
//! at this level; they are reported through [`ValidationError`] (record
//! excluded, kept in the invalid bucket) or `RecordFlag`s (record kept).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Import error: {0}")]
    Import(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The document-understanding collaborator could not produce output
    #[error("Extraction failed for {document}: {reason}")]
    ExtractionFailed { document: String, reason: String },

    /// The collaborator answered, but not in the extraction schema
    #[error("Schema violation in {document}: {reason}")]
    SchemaViolation { document: String, reason: String },

    /// A payer directory call failed (possibly transiently)
    #[error("Payer directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Batch cancelled before reaching {0}")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A record that cannot be normalized because a field required for its
/// source kind is missing or unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Document the record came from (`provenance.document_id`)
    pub document_id: String,
    /// Line within the document, for multi-record documents
    pub line: Option<u32>,
    /// Name of the offending field
    pub field: String,
    /// Human-readable reason shown to reviewers
    pub reason: String,
}

impl ValidationError {
    pub fn new(
        document_id: impl Into<String>,
        line: Option<u32>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            line,
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(
                f,
                "{} line {}: {} ({})",
                self.document_id, line, self.reason, self.field
            ),
            None => write!(f, "{}: {} ({})", self.document_id, self.reason, self.field),
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_includes_line() {
        let err = ValidationError::new("deposit-0208.jpg", Some(3), "amount", "Amount is missing");
        assert_eq!(
            err.to_string(),
            "deposit-0208.jpg line 3: Amount is missing (amount)"
        );
    }

    #[test]
    fn test_validation_converts_into_error() {
        let err: Error = ValidationError::new("a.csv", None, "payment_ref", "missing").into();
        assert!(matches!(err, Error::Validation(_)));
    }
}
