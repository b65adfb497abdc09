use thiserror::Error;

use crate::caching::CacheError;

/// An error that happens when executing a request against the upstream APIs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request produced no response at all, due to connection loss,
    /// DNS resolution failure, or a timeout.
    ///
    /// The attached string contains the transport's message.
    #[error("network error: {0}")]
    Network(String),
    /// The server responded with a non-success status code.
    #[error("unexpected status code: {status}")]
    Http {
        /// The HTTP status code of the response.
        status: u16,
    },
    /// The response arrived but its body could not be decoded.
    #[error("malformed response: {0}")]
    Parse(String),
    /// Reading or writing the response cache failed.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    /// The request kept failing with retryable errors until the retry
    /// budget ran out. The source is the error of the final attempt.
    #[error("giving up after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Total number of attempts that were made, the initial one included.
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt of the same request can be expected to succeed.
    ///
    /// A request that never got a response is always worth retrying. Of the
    /// responses, only 429 and the 5xx range are; any other status reflects
    /// a problem with the request itself and fails immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) => true,
            FetchError::Http { status } => matches!(*status, 429 | 500..=599),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

/// A [`FetchError`] annotated with which request it was that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to fetch {description}: {source}")]
pub struct RequestError {
    /// Human readable description of the request, e.g. "portfolio history
    /// for account X".
    pub description: String,
    #[source]
    pub source: FetchError,
}

impl RequestError {
    pub fn new(description: impl Into<String>, source: FetchError) -> Self {
        Self {
            description: description.into(),
            source,
        }
    }
}
