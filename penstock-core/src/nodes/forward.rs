use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::message::{Message, StreamId};
use crate::nodes::{Bolt, Emitter};
use crate::transport::MessageSink;
use crate::transport::inmem::{InMemoryBroker, InMemorySink};

#[derive(Debug, Clone, Deserialize)]
struct ForwardSettings {
    topic: String,
}

/// Publishes each document to a broker topic. A sink by nature: it never
/// emits, whatever its `final` flag says.
pub struct ForwardBolt {
    broker: InMemoryBroker,
    name: String,
    sink: Option<InMemorySink>,
}

impl ForwardBolt {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            name: String::new(),
            sink: None,
        }
    }
}

#[async_trait]
impl Bolt for ForwardBolt {
    async fn init(&mut self, name: &str, config: Value, _emitter: Emitter) -> Result<()> {
        self.name = name.to_string();
        let settings: ForwardSettings = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("forward settings: {e}")))?;
        let mut sink = self.broker.sink(settings.topic);
        sink.connect().await?;
        self.sink = Some(sink);
        Ok(())
    }

    async fn receive(&mut self, message: Message, _stream: StreamId) -> Result<()> {
        let payload = serde_json::to_vec(&message.body)
            .map_err(|e| Error::Processing(format!("{}: encoding document: {e}", self.name)))?;
        let sink = self.sink.as_mut().ok_or_else(|| {
            Error::Processing(format!("forward bolt {} not initialized", self.name))
        })?;
        sink.publish(Bytes::from(payload)).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.close().await?;
        }
        Ok(())
    }
}
