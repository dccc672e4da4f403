//! Error and result types shared by the indexing and streaming engine.

use std::io;
use thiserror::Error;

use crate::files::FileType;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while reading, writing or indexing a shapefile set
#[derive(Debug, Error)]
pub enum ShapefileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A file failed a structural check (bad magic, short read, missing
    /// completion marker, checksum mismatch).
    #[error("Corrupt {file_type} file: {message}")]
    Corrupt { file_type: FileType, message: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("No more features available")]
    NoSuchElement,
}

impl ShapefileError {
    pub(crate) fn corrupt(file_type: FileType, message: impl Into<String>) -> Self {
        ShapefileError::Corrupt {
            file_type,
            message: message.into(),
        }
    }

    /// Returns true if the error means the file itself is damaged or
    /// truncated, as opposed to an environmental I/O failure.
    pub fn is_corruption(&self) -> bool {
        match self {
            ShapefileError::Corrupt { .. } | ShapefileError::Serialization(_) => true,
            ShapefileError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }
}

impl From<bincode::error::EncodeError> for ShapefileError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ShapefileError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for ShapefileError {
    fn from(err: bincode::error::DecodeError) -> Self {
        match err {
            bincode::error::DecodeError::Io { inner, .. } => ShapefileError::Io(inner),
            other => ShapefileError::Serialization(other.to_string()),
        }
    }
}

impl From<tempfile::PersistError> for ShapefileError {
    fn from(err: tempfile::PersistError) -> Self {
        ShapefileError::Io(err.error)
    }
}

/// Result type for shapefile operations
pub type ShapefileResult<T> = Result<T, ShapefileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_error_display() {
        let err = ShapefileError::corrupt(FileType::Fix, "missing end marker");
        assert_eq!(err.to_string(), "Corrupt fix file: missing end marker");
        assert!(err.is_corruption());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: ShapefileError = io_err.into();
        assert!(matches!(err, ShapefileError::Io(_)));
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_unexpected_eof_is_corruption() {
        let err: ShapefileError = io::Error::new(io::ErrorKind::UnexpectedEof, "short").into();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_closed_display() {
        let err = ShapefileError::Closed("Feature reader");
        assert_eq!(err.to_string(), "Feature reader is closed");
    }
}
