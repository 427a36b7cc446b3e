//! Typed errors for the storage engine.
//!
//! Every failure raised by the store, query engine, or search index is a
//! [`StoreError`]. Each variant carries a stable numeric code and an
//! HTTP-style status so the calling layer can forward it verbatim as an
//! [`ErrorPayload`].

use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("invalid file pattern: {}", .0.display())]
    InvalidPattern(PathBuf),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt document {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("index error: {0}")]
    Index(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Error body surfaced to the caller boundary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: u16,
    pub message: String,
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Conflict(_) => "conflict",
            StoreError::InvalidPattern(_) => "invalid_pattern",
            StoreError::Validation(_) => "validation",
            StoreError::Io(_) | StoreError::Corrupt { .. } | StoreError::Index(_) => "internal",
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 12,
            StoreError::Conflict(_) => 30,
            StoreError::InvalidPattern(_) => 40,
            StoreError::Validation(_) => 422,
            StoreError::Io(_) => 99,
            StoreError::Corrupt { .. } => 98,
            StoreError::Index(_) => 97,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 404,
            StoreError::Conflict(_) => 409,
            StoreError::InvalidPattern(_) => 400,
            StoreError::Validation(_) => 422,
            StoreError::Io(_) | StoreError::Corrupt { .. } | StoreError::Index(_) => 500,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().to_string(),
            code: self.code(),
            message: self.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_stable_code() {
        let err = StoreError::NotFound("space/a".to_string());
        let payload = err.payload();
        assert_eq!(payload.kind, "not_found");
        assert_eq!(payload.code, 12);
        assert_eq!(err.status(), 404);
        assert!(payload.message.contains("space/a"));
    }

    #[test]
    fn test_io_errors_are_internal() {
        let err: StoreError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(err.kind(), "internal");
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_payload_serializes_type_field() {
        let payload = StoreError::Conflict("x".into()).payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "conflict");
        assert_eq!(json["code"], 30);
    }
}
