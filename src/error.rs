//! Error types for shapefile and index access.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ShapeError>;

/// Errors raised by the shapefile codec, the spatial indexes, and the
/// index builder.
///
/// Index *unavailability* is deliberately not represented here: a missing or
/// unreadable index is a soft condition that the query layer absorbs by
/// falling back to a full scan. Only conditions that must stop the caller
/// become a `ShapeError`.
#[derive(Debug, Error)]
pub enum ShapeError {
    /// Malformed header or version mismatch in a binary file.
    #[error("invalid file format: {0}")]
    Format(String),

    /// Fewer bytes available than the declared record length.
    #[error("truncated record {record_number}: expected {expected} bytes, got {actual}")]
    TruncatedRecord {
        record_number: u32,
        expected: usize,
        actual: usize,
    },

    /// A shape type code outside the shapefile specification.
    #[error("unknown shape type code {0}")]
    InvalidShapeType(i32),

    /// Exceeded the maximum wait for another thread's in-progress index build.
    #[error("timed out after {0:?} waiting for an in-progress index build")]
    BuildTimeout(std::time::Duration),

    /// A finished index build could not replace the target file. The previous
    /// index, if any, is still intact.
    #[error("could not commit index file {path}: {reason}")]
    Commit { path: String, reason: String },

    /// The operation needs a capability the store does not have, e.g. random
    /// record access without an offset index file.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ShapeError = io.into();
        assert!(matches!(err, ShapeError::Io(_)));
    }

    #[test]
    fn test_display_messages() {
        let err = ShapeError::TruncatedRecord {
            record_number: 7,
            expected: 32,
            actual: 10,
        };
        assert!(err.to_string().contains("record 7"));

        let err = ShapeError::Format("bad magic".into());
        assert!(err.to_string().contains("bad magic"));
    }
}
