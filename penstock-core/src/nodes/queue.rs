use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::message::Message;
use crate::nodes::Spout;
use crate::transport::QueueAdapter;
use crate::transport::inmem::InMemoryBroker;

#[derive(Debug, Clone, Deserialize)]
struct QueueSettings {
    topic: String,
    #[serde(flatten)]
    watermarks: crate::config::WatermarkSpec,
}

/// Spout over one broker topic, with watermark throttling from its init
/// payload (`topic`, `high_water`, `low_water`).
pub struct QueueSpout {
    broker: InMemoryBroker,
    name: String,
    adapter: Option<QueueAdapter>,
    seq: u64,
}

impl QueueSpout {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            name: String::new(),
            adapter: None,
            seq: 0,
        }
    }

    fn adapter_mut(&mut self) -> Result<&mut QueueAdapter> {
        self.adapter
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("queue spout {} not initialized", self.name)))
    }
}

#[async_trait]
impl Spout for QueueSpout {
    async fn init(&mut self, name: &str, config: Value) -> Result<()> {
        self.name = name.to_string();
        let settings: QueueSettings = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("queue spout settings: {e}")))?;

        let source = Box::new(self.broker.source(settings.topic));
        let mut adapter = QueueAdapter::new(source, settings.watermarks);
        adapter.connect().await?;
        // stay quiet until the engine calls run()
        adapter.disable().await?;
        self.adapter = Some(adapter);
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.adapter_mut()?.enable().await
    }

    async fn pause(&mut self) -> Result<()> {
        self.adapter_mut()?.disable().await
    }

    async fn next(&mut self) -> Result<Option<Message>> {
        let adapter = self.adapter_mut()?;
        adapter.intake().await?;
        let Some(body) = adapter.next().await? else {
            return Ok(None);
        };
        self.seq += 1;
        Ok(Some(Message::new(self.name.clone(), self.seq, body)))
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.close().await?;
        }
        Ok(())
    }
}
