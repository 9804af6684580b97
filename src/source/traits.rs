use async_trait::async_trait;
use bytes::Bytes;

use crate::error::FetchError;

/// One outbound chunk request: inclusive byte range `[start, end]` of `url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub url: String,
    pub start: u64,
    pub end: u64,
    /// Ask intermediaries to skip their caches for this request.
    pub bypass_cache: bool,
}

impl RangeRequest {
    /// Number of bytes the inclusive range covers.
    pub fn byte_count(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Payload of a successful chunk request.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    /// Total resource length taken from the `Content-Range` total.
    pub total_size: u64,
    pub data: Bytes,
}

#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch_range(&self, request: &RangeRequest) -> Result<RangeResponse, FetchError>;
}
