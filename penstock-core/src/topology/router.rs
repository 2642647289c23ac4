//! Stream routing: `(source, stream id)` to the ordered destinations behind
//! that edge. Destinations come out in subscription order. The error stream
//! is wired exactly like any other named stream; the router attaches no
//! semantics to the name.

use std::collections::HashMap;

use crate::message::{Message, StreamId};

/// Immutable after graph build. Positions are topological node indices.
pub struct StreamRouter {
    edges: Vec<HashMap<StreamId, Vec<usize>>>,
}

impl StreamRouter {
    pub(crate) fn new(nodes: usize) -> Self {
        Self {
            edges: vec![HashMap::new(); nodes],
        }
    }

    pub(crate) fn subscribe(&mut self, source: usize, stream: StreamId, destination: usize) {
        if let Some(streams) = self.edges.get_mut(source) {
            streams.entry(stream).or_default().push(destination);
        }
    }

    /// Ordered destinations for an edge. Empty means a dead-end stream:
    /// dropping the message there is a no-op for the emitting node, not an
    /// error.
    pub fn resolve(&self, source: usize, stream: &StreamId) -> &[usize] {
        self.edges
            .get(source)
            .and_then(|streams| streams.get(stream))
            .map_or(&[], Vec::as_slice)
    }

    /// Deep copies for fan-out: one independently-mutable message per
    /// destination. The original moves into the last slot so a single
    /// destination costs no copy.
    pub(crate) fn copies(message: Message, destinations: usize) -> Vec<Message> {
        let mut out = Vec::with_capacity(destinations);
        for _ in 1..destinations {
            out.push(message.clone());
        }
        if destinations > 0 {
            out.push(message);
        }
        out
    }
}
