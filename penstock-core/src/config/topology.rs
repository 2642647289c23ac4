//! Serde model of the topology definition: engine-wide options, spout and
//! bolt specs, and topology-scoped variables. Node `init` payloads stay
//! opaque JSON; each stage parses its own slice of it at init time.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::Result;
use crate::config::DEFAULT_HEARTBEAT_MS;
use crate::error::Error;
use crate::message::StreamId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyDefinition {
    #[serde(default)]
    pub general: GeneralSpec,
    #[serde(default)]
    pub spouts: Vec<SpoutSpec>,
    #[serde(default)]
    pub bolts: Vec<BoltSpec>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl TopologyDefinition {
    /// Parse a definition from JSON and substitute topology variables into
    /// the node init payloads.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut definition: TopologyDefinition = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("parsing topology definition: {e}")))?;
        definition.resolve_variables();
        Ok(definition)
    }

    /// Replace `${name}` placeholders in every string field of every node
    /// init payload. Lookup order: the definition's `variables` map, then
    /// the process environment. Unresolved placeholders are left verbatim
    /// with a warning.
    pub fn resolve_variables(&mut self) {
        for spout in &mut self.spouts {
            substitute_value(&mut spout.init, &self.variables);
        }
        for bolt in &mut self.bolts {
            substitute_value(&mut bolt.init, &self.variables);
        }
    }
}

/// Engine-wide options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSpec {
    /// heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u64,
    /// accepted for definition compatibility; in-process delivery carries
    /// structured documents end-to-end and does not consult it
    #[serde(default)]
    pub pass_binary_messages: bool,
}

impl GeneralSpec {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat)
    }
}

impl Default for GeneralSpec {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT_MS,
            pass_binary_messages: false,
        }
    }
}

fn default_heartbeat() -> u64 {
    DEFAULT_HEARTBEAT_MS
}

/// A source node: originates messages, has no inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoutSpec {
    /// unique across the whole graph
    pub name: String,
    /// registry tag selecting the implementation
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_object")]
    pub init: Value,
}

/// A processing node: one or more inputs, zero or more emitted streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoltSpec {
    /// unique across the whole graph
    pub name: String,
    /// registry tag selecting the implementation
    #[serde(rename = "type")]
    pub kind: String,
    /// upstream subscriptions, in declaration order
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default = "empty_object")]
    pub init: Value,
    /// terminal bolt: the engine discards anything it emits
    #[serde(default, rename = "final")]
    pub terminal: bool,
}

/// One upstream subscription of a bolt. A missing `stream_id` subscribes to
/// the source's default stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub source: String,
    pub stream_id: Option<String>,
}

impl InputSpec {
    pub fn stream(&self) -> StreamId {
        StreamId::from(self.stream_id.as_deref())
    }
}

/// Buffer thresholds as they appear inside queue-spout init payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkSpec {
    #[serde(default = "default_high_water")]
    pub high_water: usize,
    #[serde(default)]
    pub low_water: usize,
}

impl Default for WatermarkSpec {
    fn default() -> Self {
        Self {
            high_water: default_high_water(),
            low_water: 0,
        }
    }
}

fn default_high_water() -> usize {
    10
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn substitute_value(value: &mut Value, vars: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            if let Some(replaced) = substitute_str(s, vars) {
                *s = replaced;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, vars);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute_value(item, vars);
            }
        }
        _ => {}
    }
}

/// Returns the substituted string, or `None` when the input holds no
/// placeholder at all.
fn substitute_str(input: &str, vars: &HashMap<String, String>) -> Option<String> {
    if !input.contains("${") {
        return None;
    }
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' || chars.peek() != Some(&'{') {
            out.push(c);
            continue;
        }
        chars.next();
        let mut name = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            name.push(c);
        }
        if !closed {
            // dangling "${..." runs to the end of the string
            out.push_str("${");
            out.push_str(&name);
            break;
        }
        match vars
            .get(&name)
            .cloned()
            .or_else(|| std::env::var(&name).ok())
        {
            Some(replacement) => out.push_str(&replacement),
            None => {
                warn!(variable = %name, "topology variable has no value, leaving placeholder");
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        }
    }
    Some(out)
}
