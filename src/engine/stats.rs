// Progress snapshots for the buffering session and counters for the interception side.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Observable state of a buffering session after its latest chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferProgress {
    pub url: String,
    pub buffered_bytes: u64,
    pub total_size: u64,
    pub percent_buffered: f64,
    /// Average download rate in MB/s since the session started.
    pub throughput_mbps: f64,
    pub elapsed_seconds: f64,
    pub estimated_remaining_seconds: f64,
    pub done: bool,
}

impl BufferProgress {
    pub fn empty(url: &str) -> Self {
        Self {
            url: url.to_string(),
            buffered_bytes: 0,
            total_size: 0,
            percent_buffered: 0.0,
            throughput_mbps: 0.0,
            elapsed_seconds: 0.0,
            estimated_remaining_seconds: 0.0,
            done: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterceptSnapshot {
    pub queries: u64,
    pub served: u64,
    pub fallbacks: u64,
    pub served_bytes: u64,
}

/// Counts how intercepted requests were resolved.
#[derive(Default)]
pub struct InterceptStats {
    queries: AtomicU64,
    served: AtomicU64,
    fallbacks: AtomicU64,
    served_bytes: AtomicU64,
}

impl InterceptStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_served(&self, bytes: u64) {
        self.served.fetch_add(1, Ordering::Relaxed);
        self.served_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InterceptSnapshot {
        InterceptSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            served: self.served.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            served_bytes: self.served_bytes.load(Ordering::Relaxed),
        }
    }
}
