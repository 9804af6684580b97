// Axum request handler: hosts the interceptor in front of the origin for the player.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::config::{INTERNAL_REQUEST_HEADER, INTERNAL_REQUEST_TAG};
use crate::engine::session::BufferEngine;
use crate::intercept::interceptor::{Interception, PartialContent, RangeInterceptor};

/// Origin headers relayed back to the player on a pass-through.
const RELAYED_HEADERS: [HeaderName; 5] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::LAST_MODIFIED,
];

#[derive(Clone)]
struct AppState {
    engine: Arc<BufferEngine>,
    interceptor: Arc<RangeInterceptor>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MediaParams {
    url: String,
}

pub struct ProxyServer {
    port: u16,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ProxyServer {
    /// Start the proxy server on a random port, returning a handle.
    pub async fn start(engine: Arc<BufferEngine>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let state = AppState {
            interceptor: Arc::new(engine.interceptor()?),
            engine,
            client: reqwest::Client::new(),
        };
        let app = Router::new()
            .route("/media", get(media_handler))
            .route("/buffer", post(buffer_handler))
            .route("/progress", get(progress_handler))
            .route("/stats", get(stats_handler))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            port,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// URL the player should use in place of `origin_url`.
    pub fn media_url(&self, origin_url: &str) -> String {
        format!(
            "http://127.0.0.1:{}/media?url={}",
            self.port,
            encode_query_value(origin_url)
        )
    }

    /// URL that starts buffering `origin_url` when POSTed to.
    pub fn buffer_url(&self, origin_url: &str) -> String {
        format!(
            "http://127.0.0.1:{}/buffer?url={}",
            self.port,
            encode_query_value(origin_url)
        )
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Everything outside the RFC 3986 unreserved set.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

/// GET /media?url=…: serve from the buffer when possible, otherwise forward.
async fn media_handler(
    State(state): State<AppState>,
    Query(params): Query<MediaParams>,
    headers: HeaderMap,
) -> Response {
    match state.interceptor.intercept(&params.url, &headers).await {
        Interception::Serve(partial) => partial_response(partial),
        Interception::PassThrough => forward(&state.client, &params.url, &headers).await,
    }
}

fn partial_response(partial: PartialContent) -> Response {
    (
        StatusCode::PARTIAL_CONTENT,
        [
            (header::CONTENT_RANGE, partial.content_range()),
            (header::CONTENT_LENGTH, partial.body.len().to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (
                HeaderName::from_static(INTERNAL_REQUEST_HEADER),
                INTERNAL_REQUEST_TAG.to_string(),
            ),
        ],
        partial.body,
    )
        .into_response()
}

/// Replay the player's request against the origin, untouched apart from hop headers.
async fn forward(client: &reqwest::Client, url: &str, headers: &HeaderMap) -> Response {
    let mut req = client.get(url);
    if let Some(range) = headers.get(header::RANGE) {
        req = req.header(header::RANGE, range.clone());
    }

    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!("forward to origin failed: {}", e);
            return (StatusCode::BAD_GATEWAY, format!("error: {}", e)).into_response();
        }
    };

    let status = resp.status();
    let mut resp_headers = HeaderMap::new();
    for name in RELAYED_HEADERS.iter() {
        if let Some(value) = resp.headers().get(name) {
            resp_headers.insert(name.clone(), value.clone());
        }
    }

    debug!(
        "forwarding {} status={} length={:?}",
        url,
        status.as_u16(),
        resp.content_length()
    );
    // Relay the body as it arrives; an open range can cover the rest of the file.
    (status, resp_headers, Body::from_stream(resp.bytes_stream())).into_response()
}

/// POST /buffer?url=…: start (or keep) buffering a resource.
async fn buffer_handler(
    State(state): State<AppState>,
    Query(params): Query<MediaParams>,
) -> Response {
    let started = state.engine.start(&params.url, None);
    debug!("buffer request url={} started={}", params.url, started);
    StatusCode::ACCEPTED.into_response()
}

/// GET /progress: metrics of the active session.
async fn progress_handler(State(state): State<AppState>) -> Response {
    match state.engine.progress() {
        Some(progress) => Json(progress).into_response(),
        None => (StatusCode::NOT_FOUND, "nothing buffering").into_response(),
    }
}

/// GET /stats: how intercepted requests were resolved.
async fn stats_handler(State(state): State<AppState>) -> Response {
    Json(state.interceptor.stats().snapshot()).into_response()
}
