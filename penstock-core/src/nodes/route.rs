use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::message::{Message, StreamId};
use crate::nodes::{Bolt, Emitter};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct RouteRule {
    /// stream to emit on when this rule matches
    stream: String,
    /// dotted path the rule inspects
    path: String,
    /// value the path must equal; when absent, presence alone matches
    equals: Option<Value>,
    /// set to false to match when the path is absent instead
    #[serde(default = "default_true")]
    exists: bool,
}

impl RouteRule {
    fn matches(&self, message: &Message) -> bool {
        let found = message.get_path(&self.path);
        match (&self.equals, self.exists) {
            (Some(expected), _) => found == Some(expected),
            (None, true) => found.is_some(),
            (None, false) => found.is_none(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RouteSettings {
    #[serde(default)]
    routes: Vec<RouteRule>,
    #[serde(default, rename = "final")]
    terminal: bool,
}

/// Redirects each message to the stream of the first matching rule. With no
/// match the message continues on its incoming stream.
pub struct RouteBolt {
    name: String,
    settings: RouteSettings,
    emitter: Emitter,
}

impl RouteBolt {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            settings: RouteSettings::default(),
            emitter: Emitter::new(),
        }
    }
}

impl Default for RouteBolt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bolt for RouteBolt {
    async fn init(&mut self, name: &str, config: Value, emitter: Emitter) -> Result<()> {
        self.name = name.to_string();
        self.settings = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("route settings: {e}")))?;
        self.emitter = emitter;
        Ok(())
    }

    async fn receive(&mut self, message: Message, stream: StreamId) -> Result<()> {
        if self.settings.terminal {
            return Ok(());
        }
        let target = self
            .settings
            .routes
            .iter()
            .find(|rule| rule.matches(&message))
            .map_or(stream, |rule| StreamId::from(rule.stream.as_str()));
        self.emitter.emit(message, target);
        Ok(())
    }
}
