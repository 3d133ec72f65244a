//! Error types for record validation
//!
//! Decoders reject records that parse but are not usable by the
//! live value store.

use thiserror::Error;

/// Record validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record key is empty")]
    EmptyKey,

    #[error("record key contains control characters: {key:?}")]
    InvalidKey { key: String },

    #[error("snapshot marker must not carry fields (found {count})")]
    MarkerWithFields { count: usize },

    #[error("field name is empty for key {key}")]
    EmptyFieldName { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_error_display() {
        let err = RecordError::EmptyKey;
        assert_eq!(err.to_string(), "record key is empty");
    }

    #[test]
    fn test_marker_error_display() {
        let err = RecordError::MarkerWithFields { count: 2 };
        assert!(err.to_string().contains("found 2"));
    }
}
