// Buffering session lifecycle: one live resource, superseded by the next distinct URL.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::buffer::RangeBuffer;
use super::downloader::{ChunkDownloader, LoopState, ProgressCallback};
use super::stats::{BufferProgress, InterceptStats};
use crate::channel::{AnswerBuffer, RangeAnswer, RangeQuery, SyncChannel, SyncMessage};
use crate::config::EngineConfig;
use crate::intercept::filter::InterceptFilter;
use crate::intercept::interceptor::RangeInterceptor;
use crate::source::traits::ChunkSource;

/// Handle to the task buffering one URL.
pub struct BufferingSession {
    url: String,
    cancel: CancellationToken,
}

impl BufferingSession {
    /// Invalidate the session. An in-flight fetch still completes, but its
    /// result is discarded and no further requests are issued.
    pub fn supersede(&self) {
        self.cancel.cancel();
    }
}

/// Owns the active session and the channel it answers range queries on.
pub struct BufferEngine {
    config: EngineConfig,
    source: Arc<dyn ChunkSource>,
    channel: SyncChannel,
    active: Mutex<Option<BufferingSession>>,
    progress_tx: watch::Sender<Option<BufferProgress>>,
    intercept_stats: Arc<InterceptStats>,
}

impl BufferEngine {
    pub fn new(config: EngineConfig, source: Arc<dyn ChunkSource>) -> anyhow::Result<Self> {
        config.validate()?;
        let channel = SyncChannel::new(config.channel_capacity);
        let (progress_tx, _) = watch::channel(None);
        Ok(Self {
            config,
            source,
            channel,
            active: Mutex::new(None),
            progress_tx,
            intercept_stats: Arc::new(InterceptStats::new()),
        })
    }

    pub fn channel(&self) -> &SyncChannel {
        &self.channel
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn intercept_stats(&self) -> &Arc<InterceptStats> {
        &self.intercept_stats
    }

    /// Start buffering `url`. Returns `false` when `url` is already the
    /// active resource, in which case nothing is restarted.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, url: &str, callback: Option<ProgressCallback>) -> bool {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|s| s.url == url) {
            debug!("buffering already active for {}", url);
            return false;
        }

        if let Some(previous) = active.take() {
            info!("superseding buffering of {} with {}", previous.url, url);
            previous.supersede();
        }

        let cancel = CancellationToken::new();
        let progress = self.progress_hook(callback);
        let downloader = ChunkDownloader::new(
            Arc::clone(&self.source),
            url.to_string(),
            self.config.chunk_size,
            Some(progress),
        );
        // Subscribe before spawning so queries published right after `start` are seen.
        let task = SessionTask {
            downloader,
            rx: self.channel.subscribe(),
            channel: self.channel.clone(),
            cancel: cancel.clone(),
            backoff: self.config.retry_backoff(),
        };

        self.progress_tx.send_replace(Some(BufferProgress::empty(url)));
        tokio::spawn(task.run());
        info!(
            "buffering started url={} chunk_size={}",
            url, self.config.chunk_size
        );

        *active = Some(BufferingSession {
            url: url.to_string(),
            cancel,
        });
        true
    }

    /// Cancel the active session, if any, without starting another.
    pub fn stop(&self) {
        if let Some(session) = self.active.lock().take() {
            info!("buffering stopped url={}", session.url);
            session.supersede();
        }
        self.progress_tx.send_replace(None);
    }

    pub fn active_url(&self) -> Option<String> {
        self.active.lock().as_ref().map(|s| s.url.clone())
    }

    /// Latest progress of the active session.
    pub fn progress(&self) -> Option<BufferProgress> {
        let url = self.active_url()?;
        let progress = self.progress_tx.borrow().clone()?;
        (progress.url == url).then_some(progress)
    }

    /// Watch progress snapshots as they are produced.
    pub fn subscribe_progress(&self) -> watch::Receiver<Option<BufferProgress>> {
        self.progress_tx.subscribe()
    }

    /// Build an interceptor that queries this engine over its channel.
    pub fn interceptor(&self) -> anyhow::Result<RangeInterceptor> {
        let filter = InterceptFilter::from_config(&self.config)?;
        Ok(RangeInterceptor::new(
            self.channel.clone(),
            filter,
            self.config.answer_timeout(),
            Arc::clone(&self.intercept_stats),
        ))
    }

    fn progress_hook(&self, callback: Option<ProgressCallback>) -> ProgressCallback {
        let tx = self.progress_tx.clone();
        Arc::new(move |progress: &BufferProgress| {
            tx.send_replace(Some(progress.clone()));
            if let Some(callback) = &callback {
                callback(progress);
            }
        })
    }
}

impl Drop for BufferEngine {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            debug!("BufferEngine dropped, cancelling session {}", session.url);
            session.supersede();
        }
    }
}

/// The long-lived task behind a [`BufferingSession`]: drives the downloader
/// and answers range queries in between, so the buffer has a single owner.
struct SessionTask {
    downloader: ChunkDownloader,
    rx: broadcast::Receiver<SyncMessage>,
    channel: SyncChannel,
    cancel: CancellationToken,
    backoff: Duration,
}

impl SessionTask {
    async fn run(mut self) {
        let mut state = LoopState::Fetching;
        loop {
            state = match state {
                LoopState::Fetching => self.fetch().await,
                LoopState::Retrying => self.wait_backoff().await,
                LoopState::Done => self.serve_until_cancelled().await,
                LoopState::Cancelled => break,
            };
        }
        debug!("session task for {} exited", self.downloader.buffer().url());
    }

    async fn fetch(&mut self) -> LoopState {
        if self.cancel.is_cancelled() {
            return LoopState::Cancelled;
        }

        let request = self.downloader.next_request();
        let source = self.downloader.source();
        let fetch = source.fetch_range(&request);
        tokio::pin!(fetch);

        let Self {
            downloader,
            rx,
            channel,
            cancel,
            ..
        } = &mut *self;
        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                msg = rx.recv() => {
                    if !handle_message(downloader.buffer(), channel, cancel, msg) {
                        break (&mut fetch).await;
                    }
                }
            }
        };

        // The session may have been superseded while the request was in flight.
        if self.cancel.is_cancelled() {
            debug!(
                "discarding chunk {} for superseded {}",
                request.header_value(),
                request.url
            );
            return LoopState::Cancelled;
        }
        self.downloader.on_response(&request, result)
    }

    async fn wait_backoff(&mut self) -> LoopState {
        let sleep = tokio::time::sleep(self.backoff);
        tokio::pin!(sleep);

        let Self {
            downloader,
            rx,
            channel,
            cancel,
            ..
        } = &mut *self;
        loop {
            tokio::select! {
                _ = &mut sleep => return LoopState::Fetching,
                _ = cancel.cancelled() => return LoopState::Cancelled,
                msg = rx.recv() => {
                    if !handle_message(downloader.buffer(), channel, cancel, msg) {
                        (&mut sleep).await;
                        return LoopState::Fetching;
                    }
                }
            }
        }
    }

    async fn serve_until_cancelled(&mut self) -> LoopState {
        let Self {
            downloader,
            rx,
            channel,
            cancel,
            ..
        } = &mut *self;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LoopState::Cancelled,
                msg = rx.recv() => {
                    if !handle_message(downloader.buffer(), channel, cancel, msg) {
                        return LoopState::Cancelled;
                    }
                }
            }
        }
    }
}

/// Handle one bus message. Returns `false` once the bus is closed.
fn handle_message(
    buffer: &RangeBuffer,
    channel: &SyncChannel,
    cancel: &CancellationToken,
    msg: Result<SyncMessage, RecvError>,
) -> bool {
    match msg {
        Ok(SyncMessage::Query(query)) => {
            if !cancel.is_cancelled() {
                channel.publish(SyncMessage::Answer(answer_query(buffer, &query)));
            }
            true
        }
        Ok(SyncMessage::Answer(_)) => true,
        Err(RecvError::Lagged(skipped)) => {
            debug!("session listener lagged, {} messages skipped", skipped);
            true
        }
        Err(RecvError::Closed) => false,
    }
}

/// Build the answer to `query` from a snapshot of `buffer`.
pub fn answer_query(buffer: &RangeBuffer, query: &RangeQuery) -> RangeAnswer {
    if query.url != buffer.url() {
        return RangeAnswer::unavailable(&query.url, query.range);
    }
    match buffer.slice_from(query.range) {
        Some(bytes) => {
            debug!(
                "range {} answered with {} bytes for {}",
                query.range,
                bytes.len(),
                query.url
            );
            RangeAnswer {
                url: query.url.clone(),
                range: query.range,
                buffer: AnswerBuffer::Bytes(bytes),
                size: buffer.total_size(),
            }
        }
        None => RangeAnswer::unavailable(&query.url, query.range),
    }
}
