//! Message is the unit of data flowing along topology edges: a mutable JSON
//! document owned by exactly one in-flight traversal at a time. Stages address
//! into it with dotted paths (see [path]). Routing information never lives
//! inside the document; it travels beside it as a [StreamId].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

pub mod path;

/// Reserved name of the stream an edge uses when no stream id is given.
pub const DEFAULT_STREAM: &str = "default";
/// Reserved name of the failure-path stream. Wired like any other named
/// stream; the engine attaches no semantics beyond the name.
pub const ERROR_STREAM: &str = "stream_error";

/// Label on an edge. A node may emit the same message shape on several
/// differently-named streams (e.g. default vs. error path).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamId {
    /// The default stream ("default", also matched by the empty string).
    Default,
    /// The reserved failure-path stream ("stream_error").
    Error,
    /// Any other named stream.
    Named(Arc<str>),
}

impl StreamId {
    pub fn as_str(&self) -> &str {
        match self {
            StreamId::Default => DEFAULT_STREAM,
            StreamId::Error => ERROR_STREAM,
            StreamId::Named(name) => name,
        }
    }
}

impl From<&str> for StreamId {
    fn from(name: &str) -> Self {
        match name {
            "" | DEFAULT_STREAM => StreamId::Default,
            ERROR_STREAM => StreamId::Error,
            other => StreamId::Named(Arc::from(other)),
        }
    }
}

impl From<Option<&str>> for StreamId {
    fn from(name: Option<&str>) -> Self {
        name.map_or(StreamId::Default, StreamId::from)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        StreamId::Default
    }
}

/// Identity of a message: the node that originated it plus a per-origin
/// sequence number. Survives routing unchanged so a traversal can be traced
/// across log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId {
    /// name of the spout (or injecting bolt) that created the message
    pub origin: Arc<str>,
    /// monotonically increasing sequence per origin
    pub seq: u64,
}

impl Default for MessageId {
    fn default() -> Self {
        Self {
            origin: Arc::from(""),
            seq: 0,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.origin, self.seq)
    }
}

/// The document that flows through the graph.
///
/// Cloning is a deep copy of the body; the router relies on this when an edge
/// fans out to more than one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// id of the message
    pub id: MessageId,
    /// the JSON document itself, mutable along the traversal
    pub body: Value,
    /// when the message entered the graph
    pub event_time: DateTime<Utc>,
}

impl Message {
    pub fn new(origin: impl Into<Arc<str>>, seq: u64, body: Value) -> Self {
        Self {
            id: MessageId {
                origin: origin.into(),
                seq,
            },
            body,
            event_time: Utc::now(),
        }
    }

    /// Read the value at a dotted path. `None` means the path does not exist,
    /// which is distinct from the path holding a JSON `null`.
    pub fn get_path(&self, dotted: &str) -> Option<&Value> {
        path::get_path(&self.body, dotted)
    }

    /// Write a value at a dotted path, creating intermediate objects as
    /// needed.
    pub fn set_path(&mut self, dotted: &str, value: Value) {
        path::set_path(&mut self.body, dotted, value);
    }
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: MessageId::default(),
            body: Value::Null,
            event_time: Utc::now(),
        }
    }
}
