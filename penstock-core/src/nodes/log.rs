use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::message::{Message, StreamId};
use crate::nodes::{Bolt, Emitter};

#[derive(Debug, Clone, Default, Deserialize)]
struct LogSettings {
    #[serde(default, rename = "final")]
    terminal: bool,
}

/// Logs every message it sees. Terminal in most topologies; a non-terminal
/// instance passes the message along unchanged.
pub struct LoggingBolt {
    name: String,
    settings: LogSettings,
    emitter: Emitter,
}

impl LoggingBolt {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            settings: LogSettings::default(),
            emitter: Emitter::new(),
        }
    }
}

impl Default for LoggingBolt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bolt for LoggingBolt {
    async fn init(&mut self, name: &str, config: Value, emitter: Emitter) -> Result<()> {
        self.name = name.to_string();
        self.settings = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("log settings: {e}")))?;
        self.emitter = emitter;
        Ok(())
    }

    async fn receive(&mut self, message: Message, stream: StreamId) -> Result<()> {
        let log_line = format!(
            "({}) Stream - {} ID - {} EventTime - {} Payload - {}",
            self.name,
            stream,
            message.id,
            message.event_time.timestamp_millis(),
            message.body,
        );
        tracing::info!("{}", log_line);
        if !self.settings.terminal {
            self.emitter.emit(message, stream);
        }
        Ok(())
    }
}
