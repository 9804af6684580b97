use thiserror::Error;

/// Failure of a single chunk fetch. All variants are recoverable by the download loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },
    #[error("response has no usable Content-Range total")]
    MissingContentRange,
    /// A response larger than the requested range, usually a stale cached
    /// entry answering a broader range.
    #[error("oversized chunk: requested {requested} bytes, received {received}")]
    Oversized { requested: u64, received: u64 },
}

impl FetchError {
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        Self::Http(error.to_string())
    }

    pub fn is_cache_anomaly(&self) -> bool {
        matches!(self, Self::Oversized { .. })
    }
}
