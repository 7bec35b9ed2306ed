//! Error types shared by the ctsieve record schemas.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or producing pipeline records.
#[derive(Error, Debug)]
pub enum Error {
    /// A line did not have the number of columns its schema requires.
    #[error("expected {expected} columns, found {found}")]
    ColumnCount {
        /// Columns required by the schema.
        expected: usize,
        /// Columns present in the line.
        found: usize,
    },

    /// A column had an invalid value.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// Bucket count must be at least one.
    #[error("bucket count must be greater than zero")]
    ZeroBuckets,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_count_display() {
        let err = Error::ColumnCount {
            expected: 7,
            found: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_invalid_field_display() {
        let err = Error::invalid("notBefore", "not an integer");
        let msg = err.to_string();
        assert!(msg.contains("notBefore"));
        assert!(msg.contains("not an integer"));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "bucket_3.csv");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("bucket_3.csv"));
    }
}
