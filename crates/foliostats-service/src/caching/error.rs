use thiserror::Error;

/// An error that happens when reading or writing a persistent cache entry.
///
/// Cache failures are never fatal for a request. Callers are expected to
/// treat a failed read as a miss and a failed write as a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Caching is not enabled because no cache directory is configured.
    #[error("caching is not enabled")]
    Disabled,
    /// The entry exists on disk but could not be decoded.
    ///
    /// The attached string contains the decoder's message.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the service itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a cache operation.
pub type CacheResult<T = ()> = Result<T, CacheError>;
