//! Switchyard common types
//!
//! The in-flight message model shared by the engine, config and binaries:
//! - Exchange: the unit of work flowing through a route
//! - Message/Body: headers plus a body that may be a one-shot stream
//! - ExchangeFailure: failure state recorded on the exchange
//! - MessageHistoryEntry: per-step history captured while routing

use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Exchange Pattern
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangePattern {
    /// Fire and forget
    #[default]
    InOnly,
    /// Request/reply
    InOut,
}

impl fmt::Display for ExchangePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangePattern::InOnly => write!(f, "InOnly"),
            ExchangePattern::InOut => write!(f, "InOut"),
        }
    }
}

// ============================================================================
// Message Bodies
// ============================================================================

/// A body backed by a reader that can be consumed exactly once.
///
/// Clones share the same reader, so once any clone has read the content
/// every other clone observes the stream as consumed.
#[derive(Clone)]
pub struct StreamBody {
    reader: Arc<Mutex<Option<Box<dyn Read + Send>>>>,
}

impl StreamBody {
    pub fn new<R: Read + Send + 'static>(reader: R) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Some(Box::new(reader)))),
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.reader.lock().is_none()
    }

    /// Drain the stream into memory. Fails if the stream was already read.
    pub fn read_to_bytes(&self) -> Result<Bytes> {
        let mut reader = self
            .reader
            .lock()
            .take()
            .ok_or(SwitchyardError::StreamConsumed)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBody")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Stream content held in memory so it can be re-read any number of times
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedStream {
    data: Bytes,
}

impl CachedStream {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// A fresh reader positioned at the start of the cached content
    pub fn reader(&self) -> Cursor<Bytes> {
        Cursor::new(self.data.clone())
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
    Json(Value),
    /// One-shot stream, not re-readable
    Stream(StreamBody),
    /// Stream content normalized into a re-readable cache
    Cached(CachedStream),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// True if reading the body does not consume it
    pub fn is_rereadable(&self) -> bool {
        !self.is_stream()
    }

    /// Short type name used in message dumps
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Empty => "null",
            Body::Text(_) => "string",
            Body::Bytes(_) => "bytes",
            Body::Json(_) => "json",
            Body::Stream(_) => "stream",
            Body::Cached(_) => "cached-stream",
        }
    }

    /// Text rendering of a re-readable body.
    ///
    /// Returns `None` for an empty body and for a one-shot stream, which
    /// must not be consumed just to be displayed.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Body::Empty | Body::Stream(_) => None,
            Body::Text(s) => Some(s.clone()),
            Body::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Body::Json(v) => Some(v.to_string()),
            Body::Cached(c) => Some(String::from_utf8_lossy(c.as_bytes()).into_owned()),
        }
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Text(value.to_string())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Text(value)
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::Bytes(value)
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

impl From<StreamBody> for Body {
    fn from(value: StreamBody) -> Self {
        Body::Stream(value)
    }
}

// ============================================================================
// Message
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Message {
    headers: IndexMap<String, Value>,
    body: Body,
}

impl Message {
    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            headers: IndexMap::new(),
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.shift_remove(name)
    }

    /// Headers in insertion order
    pub fn headers(&self) -> &IndexMap<String, Value> {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }
}

// ============================================================================
// Failure State
// ============================================================================

/// Failure recorded on an exchange when a step, advice or strategy fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExchangeFailure {
    pub kind: String,
    pub message: String,
    /// Node the failure was raised at, if known
    pub node_id: Option<String>,
}

impl ExchangeFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            node_id: None,
        }
    }

    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

// ============================================================================
// Message History
// ============================================================================

/// One visited step, recorded when route-level message history is enabled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHistoryEntry {
    pub route_id: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
}

// ============================================================================
// Exchange
// ============================================================================

/// The in-flight unit of work flowing through a route
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    message: Message,
    properties: HashMap<String, Value>,
    failure: Option<ExchangeFailure>,
    route_id: Option<String>,
    history: Vec<MessageHistoryEntry>,
    created_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(pattern: ExchangePattern) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern,
            message: Message::default(),
            properties: HashMap::new(),
            failure: None,
            route_id: None,
            history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// An InOnly exchange carrying the given body
    pub fn with_body(body: impl Into<Body>) -> Self {
        let mut exchange = Self::new(ExchangePattern::InOnly);
        exchange.message.set_body(body);
        exchange
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn failure(&self) -> Option<&ExchangeFailure> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn set_failure(&mut self, failure: ExchangeFailure) {
        self.failure = Some(failure);
    }

    pub fn take_failure(&mut self) -> Option<ExchangeFailure> {
        self.failure.take()
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn set_route_id(&mut self, route_id: impl Into<String>) {
        self.route_id = Some(route_id.into());
    }

    pub fn history(&self) -> &[MessageHistoryEntry] {
        &self.history
    }

    pub fn push_history(&mut self, entry: MessageHistoryEntry) {
        self.history.push(entry);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SwitchyardError {
    #[error("Stream body has already been consumed")]
    StreamConsumed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Body conversion error: {0}")]
    Conversion(String),
}

pub type Result<T> = std::result::Result<T, SwitchyardError>;
