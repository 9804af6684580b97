// Cross-context message bus used to ask the buffering session for byte ranges.

use bytes::Bytes;
use tokio::sync::broadcast;

/// "Does resource `url` have bytes starting at `range`?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub url: String,
    pub range: u64,
}

/// Payload of an answer: buffered bytes, or the "not satisfiable" sentinel.
///
/// `Unavailable` is distinct from `Bytes` holding an empty slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerBuffer {
    Bytes(Bytes),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeAnswer {
    /// Resource the answer is about; echoed from the query.
    pub url: String,
    pub range: u64,
    pub buffer: AnswerBuffer,
    /// Total resource size, 0 when unavailable.
    pub size: u64,
}

impl RangeAnswer {
    pub fn unavailable(url: &str, range: u64) -> Self {
        Self {
            url: url.to_string(),
            range,
            buffer: AnswerBuffer::Unavailable,
            size: 0,
        }
    }

    /// Whether this answers a query for `url` at `range`.
    pub fn answers(&self, url: &str, range: u64) -> bool {
        self.range == range && self.url == url
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.buffer {
            AnswerBuffer::Bytes(b) => Some(b),
            AnswerBuffer::Unavailable => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Query(RangeQuery),
    Answer(RangeAnswer),
}

/// Best-effort broadcast bus: a message reaches the subscribers present when it
/// is published. Publishing never blocks and is dropped when nobody listens.
#[derive(Clone, Debug)]
pub struct SyncChannel {
    tx: broadcast::Sender<SyncMessage>,
}

impl SyncChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, message: SyncMessage) {
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }
}
