use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::Result;
use crate::error::Error;
use crate::message::Message;
use crate::nodes::Spout;

#[derive(Debug, Clone, Deserialize)]
struct GeneratorSettings {
    /// messages per duration window
    #[serde(default = "default_rpu")]
    rpu: u32,
    /// JSON template each message starts from
    #[serde(default)]
    content: Value,
    /// window length in milliseconds
    #[serde(default = "default_duration_ms")]
    duration: u64,
    /// total number of messages to produce; unbounded when absent
    #[serde(default)]
    count: Option<u64>,
    /// extra random delay per message, in milliseconds
    #[serde(default)]
    jitter: u64,
}

fn default_rpu() -> u32 {
    1
}

fn default_duration_ms() -> u64 {
    1000
}

/// Produces copies of a JSON template at a steady rate. Polling before
/// `run` (or after `pause`) yields nothing.
pub struct GeneratorSpout {
    name: String,
    settings: GeneratorSettings,
    running: bool,
    produced: u64,
    next_emit: Option<Instant>,
}

impl GeneratorSpout {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            settings: GeneratorSettings {
                rpu: default_rpu(),
                content: Value::Null,
                duration: default_duration_ms(),
                count: None,
                jitter: 0,
            },
            running: false,
            produced: 0,
            next_emit: None,
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.settings.duration / u64::from(self.settings.rpu))
    }
}

impl Default for GeneratorSpout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Spout for GeneratorSpout {
    async fn init(&mut self, name: &str, config: Value) -> Result<()> {
        self.name = name.to_string();
        self.settings = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("generator settings: {e}")))?;
        if self.settings.rpu == 0 {
            return Err(Error::Config("generator rpu must be positive".into()));
        }
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.running = true;
        self.next_emit.get_or_insert_with(Instant::now);
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Message>> {
        if !self.running {
            return Ok(None);
        }
        if let Some(count) = self.settings.count
            && self.produced >= count
        {
            return Ok(None);
        }
        let due = match self.next_emit {
            Some(at) => at,
            None => return Ok(None),
        };
        if Instant::now() < due {
            return Ok(None);
        }

        let mut delay = self.interval();
        if self.settings.jitter > 0 {
            delay += Duration::from_millis(rand::rng().random_range(0..=self.settings.jitter));
        }
        self.next_emit = Some(due + delay);
        self.produced += 1;
        Ok(Some(Message::new(
            self.name.clone(),
            self.produced,
            self.settings.content.clone(),
        )))
    }
}
