use anyhow::Result;
use axum::http::{header, HeaderMap};
use regex::Regex;

use crate::config::{EngineConfig, INTERNAL_REQUEST_HEADER};

/// Parse the open-ended form `bytes=R-`. Two-sided and suffix ranges are rejected.
pub fn parse_open_range(value: &str) -> Option<u64> {
    let rest = value.strip_prefix("bytes=")?;
    let start = rest.strip_suffix('-')?;
    if start.is_empty() || !start.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    start.parse::<u64>().ok()
}

/// Eligibility predicate for outbound resource requests.
#[derive(Debug, Clone)]
pub struct InterceptFilter {
    patterns: Vec<Regex>,
}

impl InterceptFilter {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(config.compile_patterns()?))
    }

    pub fn matches_url(&self, url: &str) -> bool {
        self.patterns.iter().all(|p| p.is_match(url))
    }

    /// Offset requested by an interceptable request, or `None` when the
    /// request must go to the network untouched.
    pub fn requested_offset(&self, url: &str, headers: &HeaderMap) -> Option<u64> {
        if headers.contains_key(INTERNAL_REQUEST_HEADER) || !self.matches_url(url) {
            return None;
        }
        let range = headers.get(header::RANGE)?.to_str().ok()?;
        parse_open_range(range.trim())
    }
}
