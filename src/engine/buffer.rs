// Growing in-memory buffer for one resource, with size bookkeeping and progress metrics.

use std::time::Instant;

use bytes::Bytes;

use super::stats::BufferProgress;

/// Append-only byte buffer for a single resource.
///
/// `data.len() == next_offset` after every append, and `next_offset` never
/// passes `total_size` once the total is known.
pub struct RangeBuffer {
    url: String,
    data: Vec<u8>,
    chunk_size: u64,
    next_offset: u64,
    total_size: u64,
    done: bool,
    started_at: Instant,
    progress: BufferProgress,
}

impl RangeBuffer {
    pub fn new(url: String, chunk_size: u64) -> Self {
        let progress = BufferProgress::empty(&url);
        Self {
            url,
            data: Vec::new(),
            chunk_size,
            next_offset: 0,
            total_size: 0,
            done: false,
            started_at: Instant::now(),
            progress,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Total resource length, 0 until the first response reports it.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn progress(&self) -> &BufferProgress {
        &self.progress
    }

    /// Inclusive `[start, end]` of the next chunk to request.
    pub fn next_range(&self) -> (u64, u64) {
        let start = self.next_offset;
        let mut end = start + self.chunk_size - 1;
        if self.total_size > 0 && end > self.total_size - 1 {
            end = self.total_size - 1;
        }
        (start, end)
    }

    /// Record the resource length. Only the first report is kept.
    pub fn learn_total(&mut self, total_size: u64) {
        if self.total_size == 0 {
            self.total_size = total_size;
        }
    }

    /// Append one fetched chunk and recompute the derived metrics.
    pub fn append(&mut self, chunk: &[u8]) {
        let len = chunk.len() as u64;
        self.data.extend_from_slice(chunk);
        self.next_offset += len;
        if len < self.chunk_size || (self.total_size > 0 && self.next_offset >= self.total_size) {
            self.done = true;
        }
        self.refresh_progress();
    }

    /// Snapshot of up to one chunk starting at `offset`, or `None` when the
    /// buffer does not yet extend past `offset`.
    pub fn slice_from(&self, offset: u64) -> Option<Bytes> {
        if self.total_size == 0 || self.len() == 0 || self.len() - 1 <= offset {
            return None;
        }
        let start = offset as usize;
        let end = (offset + self.chunk_size).min(self.len()) as usize;
        Some(Bytes::copy_from_slice(&self.data[start..end]))
    }

    fn refresh_progress(&mut self) {
        let buffered = self.len() as f64;
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let percent = if self.total_size > 0 {
            buffered / (self.total_size as f64 / 100.0)
        } else {
            0.0
        };
        let throughput = if elapsed > 0.0 {
            buffered / 1024.0 / 1024.0 / elapsed
        } else {
            0.0
        };
        let remaining = if percent > 0.0 {
            (elapsed / percent) * (100.0 - percent)
        } else {
            0.0
        };

        self.progress = BufferProgress {
            url: self.url.clone(),
            buffered_bytes: self.len(),
            total_size: self.total_size,
            percent_buffered: percent,
            throughput_mbps: throughput,
            elapsed_seconds: elapsed,
            estimated_remaining_seconds: remaining,
            done: self.done,
        };
    }
}
