// Buffering session tests against an in-process origin that records every request.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use ma_buffer_engine::config::EngineConfig;
use ma_buffer_engine::engine::downloader::ProgressCallback;
use ma_buffer_engine::engine::session::BufferEngine;
use ma_buffer_engine::engine::stats::BufferProgress;
use ma_buffer_engine::error::FetchError;
use ma_buffer_engine::intercept::interceptor::Interception;
use ma_buffer_engine::source::traits::{ChunkSource, RangeRequest, RangeResponse};

const URL_A: &str = "http://origin.test/video/a.mp4";
const URL_B: &str = "http://origin.test/video/b.mp4";

enum Scripted {
    Fail,
    Oversized,
}

struct VirtualOrigin {
    content: Vec<u8>,
    requests: Mutex<Vec<RangeRequest>>,
    script: Mutex<VecDeque<Scripted>>,
    gate: Mutex<Option<(String, Arc<Notify>)>>,
}

impl VirtualOrigin {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            content: (0..size).map(|i| (i % 251) as u8).collect(),
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
        })
    }

    fn script(&self, steps: Vec<Scripted>) {
        self.script.lock().extend(steps);
    }

    /// Hold every request for `url` until `release` is called.
    fn hold(&self, url: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock() = Some((url.to_string(), notify.clone()));
        notify
    }

    fn requests(&self) -> Vec<RangeRequest> {
        self.requests.lock().clone()
    }

    fn requests_for(&self, url: &str) -> Vec<RangeRequest> {
        self.requests().into_iter().filter(|r| r.url == url).collect()
    }
}

#[async_trait]
impl ChunkSource for VirtualOrigin {
    async fn fetch_range(&self, request: &RangeRequest) -> Result<RangeResponse, FetchError> {
        self.requests.lock().push(request.clone());

        let gate = self.gate.lock().clone();
        if let Some((url, notify)) = gate {
            if url == request.url {
                notify.notified().await;
            }
        }

        let total = self.content.len() as u64;
        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(Scripted::Fail) => return Err(FetchError::Status { status: 503 }),
            Some(Scripted::Oversized) => {
                return Ok(RangeResponse {
                    total_size: total,
                    data: Bytes::from(vec![0u8; request.byte_count() as usize + 10]),
                })
            }
            None => {}
        }

        let end = request.end.min(total - 1);
        Ok(RangeResponse {
            total_size: total,
            data: Bytes::copy_from_slice(&self.content[request.start as usize..=end as usize]),
        })
    }
}

fn config(chunk_size: u64) -> EngineConfig {
    EngineConfig {
        chunk_size,
        retry_backoff_ms: 20,
        answer_timeout_ms: 200,
        ..EngineConfig::default()
    }
}

async fn wait_done(engine: &BufferEngine, url: &str) -> BufferProgress {
    let mut rx = engine.subscribe_progress();
    let progress = tokio::time::timeout(
        Duration::from_secs(10),
        rx.wait_for(|p| p.as_ref().is_some_and(|p| p.url == url && p.done)),
    )
    .await
    .expect("buffering did not finish in time")
    .expect("progress channel closed");
    progress.clone().unwrap()
}

async fn wait_for_requests(origin: &VirtualOrigin, url: &str, count: usize) {
    for _ in 0..500 {
        if origin.requests_for(url).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("origin never saw {} requests for {}", count, url);
}

fn open_range(offset: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::RANGE,
        HeaderValue::from_str(&format!("bytes={}-", offset)).unwrap(),
    );
    headers
}

#[tokio::test]
async fn test_three_chunks_for_seven_megabytes() {
    let origin = VirtualOrigin::new(7_000_000);
    let engine = BufferEngine::new(config(3_000_000), origin.clone()).unwrap();

    assert!(engine.start(URL_A, None));
    let progress = wait_done(&engine, URL_A).await;

    let ranges: Vec<(u64, u64)> = origin.requests().iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(
        ranges,
        vec![
            (0, 2_999_999),
            (3_000_000, 5_999_999),
            (6_000_000, 6_999_999)
        ]
    );
    assert_eq!(progress.total_size, 7_000_000);
    assert_eq!(progress.buffered_bytes, 7_000_000);
    assert!((progress.percent_buffered - 100.0).abs() < 1e-9);

    // No further requests after the last chunk.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(origin.requests().len(), 3);
}

#[tokio::test]
async fn test_start_same_url_is_idempotent() {
    let origin = VirtualOrigin::new(2500);
    let engine = BufferEngine::new(config(1000), origin.clone()).unwrap();

    assert!(engine.start(URL_A, None));
    wait_done(&engine, URL_A).await;
    assert!(!engine.start(URL_A, None));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(origin.requests().len(), 3);
    assert_eq!(engine.progress().unwrap().buffered_bytes, 2500);
}

#[tokio::test]
async fn test_new_url_supersedes_in_flight_session() {
    let origin = VirtualOrigin::new(2500);
    let engine = BufferEngine::new(config(1000), origin.clone()).unwrap();
    let release_a = origin.hold(URL_A);

    engine.start(URL_A, None);
    wait_for_requests(&origin, URL_A, 1).await;

    assert!(engine.start(URL_B, None));
    assert_eq!(engine.active_url().as_deref(), Some(URL_B));

    let progress = wait_done(&engine, URL_B).await;
    assert_eq!(progress.buffered_bytes, 2500);
    assert_eq!(origin.requests_for(URL_B)[0].start, 0);

    // A's in-flight fetch resolves now; its result must be dropped.
    release_a.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(origin.requests_for(URL_A).len(), 1);
    assert_eq!(engine.progress().unwrap().url, URL_B);
}

#[tokio::test]
async fn test_transient_failure_retries_same_offset() {
    let origin = VirtualOrigin::new(2500);
    origin.script(vec![Scripted::Fail, Scripted::Fail]);
    let engine = BufferEngine::new(config(1000), origin.clone()).unwrap();

    engine.start(URL_A, None);
    let progress = wait_done(&engine, URL_A).await;
    assert_eq!(progress.buffered_bytes, 2500);

    let starts: Vec<u64> = origin.requests().iter().map(|r| r.start).collect();
    assert_eq!(starts, vec![0, 0, 0, 1000, 2000]);
}

#[tokio::test]
async fn test_oversized_chunk_retries_once_without_cache() {
    let origin = VirtualOrigin::new(2500);
    origin.script(vec![Scripted::Oversized, Scripted::Oversized]);
    let engine = BufferEngine::new(config(1000), origin.clone()).unwrap();

    engine.start(URL_A, None);
    let progress = wait_done(&engine, URL_A).await;
    assert_eq!(progress.buffered_bytes, 2500);

    let requests = origin.requests();
    let shape: Vec<(u64, bool)> = requests.iter().map(|r| (r.start, r.bypass_cache)).collect();
    assert_eq!(
        shape,
        vec![(0, false), (0, true), (0, false), (1000, false), (2000, false)]
    );
}

#[tokio::test]
async fn test_progress_callback_sees_every_chunk() {
    let origin = VirtualOrigin::new(2500);
    let engine = BufferEngine::new(config(1000), origin.clone()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let callback: ProgressCallback = Arc::new(move |p: &BufferProgress| {
        counter.fetch_add(1, Ordering::SeqCst);
        if !p.done {
            panic!("callback failure must not stop the download");
        }
    });

    engine.start(URL_A, Some(callback));
    let progress = wait_done(&engine, URL_A).await;
    assert!(progress.done);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_interceptor_served_from_buffer() {
    let origin = VirtualOrigin::new(2500);
    let engine = BufferEngine::new(config(1000), origin.clone()).unwrap();
    let interceptor = engine.interceptor().unwrap();

    engine.start(URL_A, None);
    wait_done(&engine, URL_A).await;

    let served = match interceptor.intercept(URL_A, &open_range(1200)).await {
        Interception::Serve(p) => p,
        other => panic!("expected a buffered response, got {:?}", other),
    };
    assert_eq!(served.body.as_ref(), &origin.content[1200..2200]);
    assert_eq!(served.content_range(), "bytes 1200-2199/2500");

    // Tail shorter than a chunk.
    let tail = match interceptor.intercept(URL_A, &open_range(2000)).await {
        Interception::Serve(p) => p,
        other => panic!("expected a buffered response, got {:?}", other),
    };
    assert_eq!(tail.content_range(), "bytes 2000-2499/2500");

    // Last byte and other resources are not satisfiable.
    assert_eq!(
        interceptor.intercept(URL_A, &open_range(2499)).await,
        Interception::PassThrough
    );
    assert_eq!(
        interceptor.intercept(URL_B, &open_range(0)).await,
        Interception::PassThrough
    );

    let snap = interceptor.stats().snapshot();
    assert_eq!((snap.queries, snap.served, snap.fallbacks), (4, 2, 2));
}

#[tokio::test]
async fn test_concurrent_intercepts_never_cross_resources() {
    let origin = VirtualOrigin::new(2500);
    let engine = BufferEngine::new(config(1000), origin.clone()).unwrap();
    let interceptor = engine.interceptor().unwrap();

    engine.start(URL_A, None);
    wait_done(&engine, URL_A).await;

    for _ in 0..50 {
        let (range_a, range_b) = (open_range(0), open_range(0));
        let (a, b) = tokio::join!(
            interceptor.intercept(URL_A, &range_a),
            interceptor.intercept(URL_B, &range_b),
        );
        match a {
            Interception::Serve(p) => assert_eq!(p.body.as_ref(), &origin.content[0..1000]),
            other => panic!("expected a buffered response, got {:?}", other),
        }
        assert_eq!(b, Interception::PassThrough);
    }

    let snap = interceptor.stats().snapshot();
    assert_eq!((snap.queries, snap.served, snap.fallbacks), (100, 50, 50));
}

#[tokio::test]
async fn test_interceptor_times_out_while_nothing_buffers() {
    let origin = VirtualOrigin::new(2500);
    let engine = BufferEngine::new(config(1000), origin.clone()).unwrap();
    let interceptor = engine.interceptor().unwrap();

    assert_eq!(
        interceptor.intercept(URL_A, &open_range(0)).await,
        Interception::PassThrough
    );
    let snap = interceptor.stats().snapshot();
    assert_eq!((snap.queries, snap.served, snap.fallbacks), (1, 0, 1));
    assert!(origin.requests().is_empty());
}

#[tokio::test]
async fn test_stop_cancels_session() {
    let origin = VirtualOrigin::new(2500);
    let engine = BufferEngine::new(config(1000), origin.clone()).unwrap();
    let release = origin.hold(URL_A);

    engine.start(URL_A, None);
    wait_for_requests(&origin, URL_A, 1).await;
    engine.stop();
    release.notify_one();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(origin.requests().len(), 1);
    assert!(engine.active_url().is_none());
    assert!(engine.progress().is_none());
}
