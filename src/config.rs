use std::time::Duration;

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;

/// Default number of bytes requested per chunk (3 MB, decimal).
pub const DEFAULT_CHUNK_SIZE: u64 = 3_000_000;

/// Fixed wait before retrying a chunk after a transient failure.
pub const RETRY_BACKOFF_MS: u64 = 1000;

/// How long the interceptor waits for an answer before letting the request through.
pub const ANSWER_TIMEOUT_MS: u64 = 1000;

/// Capacity of the cross-context broadcast channel.
pub const CHANNEL_CAPACITY: usize = 64;

/// Header that marks traffic generated by the engine itself.
pub const INTERNAL_REQUEST_HEADER: &str = "x-made-by";

/// Value carried by [`INTERNAL_REQUEST_HEADER`].
pub const INTERNAL_REQUEST_TAG: &str = "ma-buffer-engine";

/// Top-level configuration for the buffering engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of each download chunk in bytes.
    pub chunk_size: u64,
    /// Backoff between retries of a failed chunk, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Bounded wait for a range answer, in milliseconds.
    pub answer_timeout_ms: u64,
    /// Broadcast capacity of the sync channel.
    pub channel_capacity: usize,
    /// Regexes a request URL must all match to be intercepted.
    pub url_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_backoff_ms: RETRY_BACKOFF_MS,
            answer_timeout_ms: ANSWER_TIMEOUT_MS,
            channel_capacity: CHANNEL_CAPACITY,
            url_patterns: vec![r"\.mp4$".to_string(), r"/(video|asset)/".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(anyhow!("chunk_size must be > 0"));
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("channel_capacity must be > 0"));
        }
        self.compile_patterns()?;
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    /// Compile `url_patterns` into regexes.
    pub fn compile_patterns(&self) -> Result<Vec<Regex>> {
        self.url_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| anyhow!("invalid url pattern {:?}: {}", p, e)))
            .collect()
    }
}
