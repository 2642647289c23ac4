//! In-process broker with named topics, used by the queue spout and forward
//! bolt in demos and tests. Real broker clients live behind the same traits.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::Result;
use crate::transport::{MessageSink, MessageSource};

const DEFAULT_FETCH_BATCH: usize = 32;

/// Shared topic map. Cheap to clone; all clones see the same topics.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, VecDeque<Bytes>>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, topic: &str, payload: Bytes) {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back(payload);
    }

    /// Remove and return up to `max` payloads from the front of a topic.
    pub fn drain(&self, topic: &str, max: usize) -> Vec<Bytes> {
        let mut topics = self.topics.lock();
        let Some(queue) = topics.get_mut(topic) else {
            return Vec::new();
        };
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn depth(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, VecDeque::len)
    }

    /// A [MessageSource] reading from one topic of this broker.
    pub fn source(&self, topic: impl Into<String>) -> InMemorySource {
        InMemorySource {
            broker: self.clone(),
            topic: topic.into(),
            batch: DEFAULT_FETCH_BATCH,
        }
    }

    /// A [MessageSink] publishing to one topic of this broker.
    pub fn sink(&self, topic: impl Into<String>) -> InMemorySink {
        InMemorySink {
            broker: self.clone(),
            topic: topic.into(),
        }
    }
}

pub struct InMemorySource {
    broker: InMemoryBroker,
    topic: String,
    batch: usize,
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn fetch(&mut self) -> Result<Vec<Bytes>> {
        Ok(self.broker.drain(&self.topic, self.batch))
    }
}

pub struct InMemorySink {
    broker: InMemoryBroker,
    topic: String,
}

#[async_trait]
impl MessageSink for InMemorySink {
    async fn publish(&mut self, payload: Bytes) -> Result<()> {
        self.broker.publish(&self.topic, payload);
        Ok(())
    }
}
