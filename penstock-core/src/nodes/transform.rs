use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::Result;
use crate::error::Error;
use crate::message::{Message, StreamId};
use crate::nodes::{Bolt, Emitter};

#[derive(Debug, Clone, Default, Deserialize)]
struct TransformSettings {
    /// target path -> source path; targets are written in path order
    #[serde(default)]
    output_template: BTreeMap<String, String>,
    #[serde(default, rename = "final")]
    terminal: bool,
}

/// Copies values between dotted paths of the document, in place. A source
/// path that does not resolve leaves its target untouched.
pub struct TransformBolt {
    name: String,
    settings: TransformSettings,
    emitter: Emitter,
}

impl TransformBolt {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            settings: TransformSettings::default(),
            emitter: Emitter::new(),
        }
    }
}

impl Default for TransformBolt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bolt for TransformBolt {
    async fn init(&mut self, name: &str, config: Value, emitter: Emitter) -> Result<()> {
        self.name = name.to_string();
        self.settings = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("transform settings: {e}")))?;
        self.emitter = emitter;
        Ok(())
    }

    async fn receive(&mut self, mut message: Message, stream: StreamId) -> Result<()> {
        for (target, source) in &self.settings.output_template {
            match message.get_path(source) {
                Some(value) => {
                    let value = value.clone();
                    message.set_path(target, value);
                }
                None => {
                    debug!(node = %self.name, path = %source, "source path missing, skipping");
                }
            }
        }
        if !self.settings.terminal {
            self.emitter.emit(message, stream);
        }
        Ok(())
    }
}
