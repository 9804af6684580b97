// Sequential chunk downloader: one range request at a time, retried until it lands.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::buffer::RangeBuffer;
use super::stats::BufferProgress;
use crate::error::FetchError;
use crate::source::traits::{ChunkSource, RangeRequest, RangeResponse};

/// Caller-supplied hook invoked after every appended chunk.
pub type ProgressCallback = Arc<dyn Fn(&BufferProgress) + Send + Sync>;

/// Where the download loop goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Request the chunk at the current offset.
    Fetching,
    /// Wait out the backoff, then fetch the same offset again.
    Retrying,
    /// Last chunk appended; the buffer stays queryable.
    Done,
    /// Superseded by a session for another URL.
    Cancelled,
}

pub struct ChunkDownloader {
    source: Arc<dyn ChunkSource>,
    buffer: RangeBuffer,
    progress: Option<ProgressCallback>,
    /// Send cache-bypass headers on the next request.
    bypass_cache: bool,
    /// The cache-bypass retry for the current offset has been spent.
    anomaly_retried: bool,
}

impl ChunkDownloader {
    pub fn new(
        source: Arc<dyn ChunkSource>,
        url: String,
        chunk_size: u64,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            source,
            buffer: RangeBuffer::new(url, chunk_size),
            progress,
            bypass_cache: false,
            anomaly_retried: false,
        }
    }

    pub fn buffer(&self) -> &RangeBuffer {
        &self.buffer
    }

    pub fn source(&self) -> Arc<dyn ChunkSource> {
        Arc::clone(&self.source)
    }

    pub fn next_request(&self) -> RangeRequest {
        let (start, end) = self.buffer.next_range();
        RangeRequest {
            url: self.buffer.url().to_string(),
            start,
            end,
            bypass_cache: self.bypass_cache,
        }
    }

    /// Apply the outcome of `request` and decide the next loop state.
    ///
    /// Must only be called by a session that is still current.
    pub fn on_response(
        &mut self,
        request: &RangeRequest,
        result: Result<RangeResponse, FetchError>,
    ) -> LoopState {
        match result.and_then(|resp| Self::check_size(request, resp)) {
            Ok(resp) => {
                self.buffer.learn_total(resp.total_size);
                self.buffer.append(&resp.data);
                self.bypass_cache = false;
                self.anomaly_retried = false;
                debug!(
                    "chunk {} appended ({} bytes, {}/{})",
                    request.header_value(),
                    resp.data.len(),
                    self.buffer.len(),
                    self.buffer.total_size()
                );
                self.notify_progress();

                if self.buffer.is_done() {
                    info!(
                        "buffering done url={} bytes={}",
                        self.buffer.url(),
                        self.buffer.len()
                    );
                    LoopState::Done
                } else {
                    LoopState::Fetching
                }
            }
            Err(e) if e.is_cache_anomaly() && !self.anomaly_retried => {
                warn!(
                    "chunk {} {}, retrying without cache",
                    request.header_value(),
                    e
                );
                self.anomaly_retried = true;
                self.bypass_cache = true;
                LoopState::Fetching
            }
            Err(e) => {
                warn!("chunk {} failed: {}, trying again", request.header_value(), e);
                self.bypass_cache = false;
                LoopState::Retrying
            }
        }
    }

    fn check_size(request: &RangeRequest, resp: RangeResponse) -> Result<RangeResponse, FetchError> {
        let received = resp.data.len() as u64;
        if received > request.byte_count() {
            return Err(FetchError::Oversized {
                requested: request.byte_count(),
                received,
            });
        }
        Ok(resp)
    }

    fn notify_progress(&self) {
        let Some(callback) = &self.progress else {
            return;
        };
        let progress = self.buffer.progress();
        if catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
            warn!("progress callback panicked, continuing download");
        }
    }
}
