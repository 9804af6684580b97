use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, CONTENT_RANGE, PRAGMA, RANGE};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use super::traits::{ChunkSource, RangeRequest, RangeResponse};
use crate::config::{INTERNAL_REQUEST_HEADER, INTERNAL_REQUEST_TAG};
use crate::error::FetchError;

/// Fetches chunks from the origin over HTTP, tagging every request as internal.
#[derive(Clone, Default)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn build_request(&self, request: &RangeRequest) -> RequestBuilder {
        let mut req = self
            .client
            .get(&request.url)
            .header(RANGE, request.header_value())
            .header(INTERNAL_REQUEST_HEADER, INTERNAL_REQUEST_TAG);
        if request.bypass_cache {
            req = req.header(CACHE_CONTROL, "no-cache").header(PRAGMA, "no-cache");
        }
        req
    }
}

/// Extract `<total>` from `Content-Range: bytes <start>-<end>/<total>`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.trim().rsplit('/').next()?;
    total.trim().parse::<u64>().ok()
}

#[async_trait]
impl ChunkSource for HttpSource {
    async fn fetch_range(&self, request: &RangeRequest) -> Result<RangeResponse, FetchError> {
        let resp = self
            .build_request(request)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            warn!(
                "http fetch failed status={} range={}",
                status.as_u16(),
                request.header_value()
            );
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let total_size = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or(FetchError::MissingContentRange)?;

        let data = resp.bytes().await.map_err(FetchError::from_reqwest)?;
        debug!(
            "http fetch range={} bytes={} total={} bypass={}",
            request.header_value(),
            data.len(),
            total_size,
            request.bypass_cache
        );
        Ok(RangeResponse { total_size, data })
    }
}
