use std::sync::Arc;

/// Error returned by the write path.
///
/// Foreign errors are wrapped in [`Arc`] so the whole enum is `Clone`: the
/// flush token records the first background flush failure and has to hand it
/// back from every subsequent `wait()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LakeError {
    /// A caller-supplied parameter is malformed or inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The requested combination of features is not supported.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// A tablet, schema, or metadata lookup came up empty.
    #[error("not found: {0}")]
    NotFound(String),
    /// An invariant the crate maintains internally was violated.
    #[error("internal error: {0}")]
    Internal(String),
    /// The surrounding runtime cancelled the operation.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// Filesystem failure while writing segments or the txn log.
    #[error("io error: {0}")]
    Io(#[source] Arc<std::io::Error>),
    /// Arrow compute or schema failure.
    #[error("arrow error: {0}")]
    Arrow(#[source] Arc<arrow_schema::ArrowError>),
    /// Parquet encode failure.
    #[error("parquet error: {0}")]
    Parquet(#[source] Arc<parquet::errors::ParquetError>),
}

impl LakeError {
    /// True iff this is a [`LakeError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, LakeError::NotFound(_))
    }
}

impl From<std::io::Error> for LakeError {
    fn from(e: std::io::Error) -> Self {
        LakeError::Io(Arc::new(e))
    }
}

impl From<arrow_schema::ArrowError> for LakeError {
    fn from(e: arrow_schema::ArrowError) -> Self {
        LakeError::Arrow(Arc::new(e))
    }
}

impl From<parquet::errors::ParquetError> for LakeError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        LakeError::Parquet(Arc::new(e))
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = LakeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_preserves_kind_and_message() {
        let err = LakeError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let copy = err.clone();
        assert!(matches!(copy, LakeError::Io(_)));
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn not_found_predicate() {
        assert!(LakeError::NotFound("tablet 7".into()).is_not_found());
        assert!(!LakeError::Internal("x".into()).is_not_found());
    }
}
