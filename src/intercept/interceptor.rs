// Range interceptor: asks the buffering session for bytes with a bounded wait.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use super::filter::InterceptFilter;
use crate::channel::{AnswerBuffer, RangeAnswer, RangeQuery, SyncChannel, SyncMessage};
use crate::engine::stats::InterceptStats;

/// Body and framing of a synthesized 206 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialContent {
    pub start: u64,
    pub total: u64,
    pub body: Bytes,
}

impl PartialContent {
    /// Inclusive last byte offset of `body`.
    pub fn end(&self) -> u64 {
        self.start + self.body.len() as u64 - 1
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end(), self.total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception {
    /// Serve this slice instead of touching the network.
    Serve(PartialContent),
    /// Let the original request proceed unmodified.
    PassThrough,
}

pub struct RangeInterceptor {
    channel: SyncChannel,
    filter: InterceptFilter,
    timeout: Duration,
    stats: Arc<InterceptStats>,
}

impl RangeInterceptor {
    pub fn new(
        channel: SyncChannel,
        filter: InterceptFilter,
        timeout: Duration,
        stats: Arc<InterceptStats>,
    ) -> Self {
        Self {
            channel,
            filter,
            timeout,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<InterceptStats> {
        &self.stats
    }

    /// Decide how to satisfy a request for `url` carrying `headers`.
    pub async fn intercept(&self, url: &str, headers: &HeaderMap) -> Interception {
        let Some(range) = self.filter.requested_offset(url, headers) else {
            return Interception::PassThrough;
        };
        self.stats.record_query();

        // Subscribe first so an immediate answer cannot be missed.
        let mut rx = self.channel.subscribe();
        self.channel.publish(SyncMessage::Query(RangeQuery {
            url: url.to_string(),
            range,
        }));

        let answer = tokio::time::timeout(self.timeout, wait_for_answer(&mut rx, url, range))
            .await
            .ok()
            .flatten();

        match answer {
            Some(RangeAnswer { buffer, size, .. }) => match buffer {
                AnswerBuffer::Bytes(body) if !body.is_empty() => {
                    let served = PartialContent {
                        start: range,
                        total: size,
                        body,
                    };
                    debug!("range satisfied {} for {}", served.content_range(), url);
                    self.stats.record_served(served.body.len() as u64);
                    Interception::Serve(served)
                }
                _ => self.fall_back(url, range, "not buffered"),
            },
            None => self.fall_back(url, range, "no answer"),
        }
    }

    fn fall_back(&self, url: &str, range: u64, reason: &str) -> Interception {
        debug!("normal fetch for {} at {} ({})", url, range, reason);
        self.stats.record_fallback();
        Interception::PassThrough
    }
}

async fn wait_for_answer(
    rx: &mut broadcast::Receiver<SyncMessage>,
    url: &str,
    range: u64,
) -> Option<RangeAnswer> {
    loop {
        match rx.recv().await {
            Ok(SyncMessage::Answer(answer)) if answer.answers(url, range) => return Some(answer),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}
