use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::message::{Message, StreamId};
use crate::nodes::{Bolt, Emitter};

fn default_error_path() -> String {
    "error".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct ValidateSettings {
    /// dotted paths that must resolve for a document to pass
    #[serde(default)]
    required: Vec<String>,
    /// where the failure reason is written before the error-stream emit
    #[serde(default = "default_error_path")]
    document_error_path: String,
    #[serde(default, rename = "final")]
    terminal: bool,
}

impl Default for ValidateSettings {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            document_error_path: default_error_path(),
            terminal: false,
        }
    }
}

/// Checks that required paths resolve. Passing documents continue on the
/// incoming stream; failing ones get the reason written into the document
/// and go out on the error stream. The reason is data; the error stream is
/// the control signal.
pub struct ValidateBolt {
    name: String,
    settings: ValidateSettings,
    emitter: Emitter,
}

impl ValidateBolt {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            settings: ValidateSettings::default(),
            emitter: Emitter::new(),
        }
    }

    fn first_missing(&self, message: &Message) -> Option<&str> {
        self.settings
            .required
            .iter()
            .map(String::as_str)
            .find(|path| message.get_path(path).is_none())
    }
}

impl Default for ValidateBolt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bolt for ValidateBolt {
    async fn init(&mut self, name: &str, config: Value, emitter: Emitter) -> Result<()> {
        self.name = name.to_string();
        self.settings = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("validate settings: {e}")))?;
        self.emitter = emitter;
        Ok(())
    }

    async fn receive(&mut self, mut message: Message, stream: StreamId) -> Result<()> {
        if self.settings.terminal {
            return Ok(());
        }
        match self.first_missing(&message) {
            None => self.emitter.emit(message, stream),
            Some(path) => {
                let reason = format!("[{}] missing required path {path:?}", self.name);
                let error_path = self.settings.document_error_path.clone();
                message.set_path(&error_path, Value::String(reason));
                self.emitter.emit(message, StreamId::Error);
            }
        }
        Ok(())
    }
}
