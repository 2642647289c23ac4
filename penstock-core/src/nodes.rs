//! Stage contract and the static node registry. A topology names its stages
//! by type tag; the registry maps each tag to a factory, so a definition can
//! only select implementations compiled into the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::message::{Message, StreamId};
use crate::transport::inmem::InMemoryBroker;

/// Emits a configurable JSON template at a fixed rate, for demos and load
/// testing.
pub mod generator;

/// Spout over a [QueueAdapter](crate::transport::QueueAdapter) and a
/// [MessageSource](crate::transport::MessageSource).
pub mod queue;

/// Copies values between dotted paths.
pub mod transform;

/// Checks required paths and diverts failures to the error stream.
pub mod validate;

/// Selects the output stream per message from a rule list.
pub mod route;

/// Logs every message; usually terminal.
pub mod log;

/// Writes messages to a [MessageSink](crate::transport::MessageSink);
/// terminal.
pub mod forward;

/// A source stage. Produces messages when polled; `run`/`pause` gate
/// production for implementations that consume from an upstream system.
#[async_trait]
pub trait Spout: Send {
    async fn init(&mut self, name: &str, config: Value) -> Result<()>;

    /// Begin producing.
    async fn run(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop admitting new data. Already-buffered messages may still be
    /// returned by `next`.
    async fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    /// Non-blocking poll for the next message.
    async fn next(&mut self) -> Result<Option<Message>>;

    async fn heartbeat(&mut self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn Spout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Spout")
    }
}

/// A processing stage. `receive` may call [Emitter::emit] any number of
/// times before it returns; the engine routes the emissions afterwards. The
/// engine never runs two `receive` calls on the same instance concurrently.
#[async_trait]
pub trait Bolt: Send {
    async fn init(&mut self, name: &str, config: Value, emitter: Emitter) -> Result<()>;

    async fn receive(&mut self, message: Message, stream: StreamId) -> Result<()>;

    async fn heartbeat(&mut self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn Bolt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Bolt")
    }
}

/// Handle bound into a bolt at init. Emissions accumulate here while a
/// `receive` runs; the engine drains them once it completes, so routing is
/// always the explicit `(message, stream)` pair and never a field inside
/// the payload.
#[derive(Clone, Default)]
pub struct Emitter {
    pending: Arc<Mutex<Vec<(Message, StreamId)>>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, message: Message, stream: StreamId) {
        self.pending.lock().push((message, stream));
    }

    /// Take everything emitted since the last drain.
    pub(crate) fn drain(&self) -> Vec<(Message, StreamId)> {
        std::mem::take(&mut *self.pending.lock())
    }
}

type SpoutFactory = Box<dyn Fn() -> Box<dyn Spout> + Send + Sync>;
type BoltFactory = Box<dyn Fn() -> Box<dyn Bolt> + Send + Sync>;

/// Type tag to factory table, populated before the graph is built.
#[derive(Default)]
pub struct NodeRegistry {
    spouts: HashMap<String, SpoutFactory>,
    bolts: HashMap<String, BoltFactory>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the transport-free builtin stages: "generator",
    /// "transform", "validate", "route", "log".
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_spout("generator", || Box::new(generator::GeneratorSpout::new()));
        registry.register_bolt("transform", || Box::new(transform::TransformBolt::new()));
        registry.register_bolt("validate", || Box::new(validate::ValidateBolt::new()));
        registry.register_bolt("route", || Box::new(route::RouteBolt::new()));
        registry.register_bolt("log", || Box::new(log::LoggingBolt::new()));
        registry
    }

    /// [Self::builtin] plus the transport stages "queue" and "forward"
    /// bound to the given broker.
    pub fn with_broker(broker: InMemoryBroker) -> Self {
        let mut registry = Self::builtin();
        let source_broker = broker.clone();
        registry.register_spout("queue", move || {
            Box::new(queue::QueueSpout::new(source_broker.clone()))
        });
        registry.register_bolt("forward", move || {
            Box::new(forward::ForwardBolt::new(broker.clone()))
        });
        registry
    }

    pub fn register_spout(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn() -> Box<dyn Spout> + Send + Sync + 'static,
    ) {
        self.spouts.insert(kind.into(), Box::new(factory));
    }

    pub fn register_bolt(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn() -> Box<dyn Bolt> + Send + Sync + 'static,
    ) {
        self.bolts.insert(kind.into(), Box::new(factory));
    }

    pub(crate) fn create_spout(&self, kind: &str) -> Result<Box<dyn Spout>> {
        self.spouts
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| Error::Config(format!("unknown spout type {kind:?}")))
    }

    pub(crate) fn create_bolt(&self, kind: &str) -> Result<Box<dyn Bolt>> {
        self.bolts
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| Error::Config(format!("unknown bolt type {kind:?}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn emitter_drains_in_emission_order() {
        let emitter = Emitter::new();
        emitter.emit(Message::new("b", 1, json!(1)), StreamId::Default);
        emitter.emit(Message::new("b", 2, json!(2)), StreamId::Error);

        let drained = emitter.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0.body, json!(1));
        assert_eq!(drained[0].1, StreamId::Default);
        assert_eq!(drained[1].1, StreamId::Error);
        assert!(emitter.drain().is_empty());
    }

    #[test]
    fn builtin_registry_resolves_tags() {
        let registry = NodeRegistry::builtin();
        assert!(registry.create_spout("generator").is_ok());
        assert!(registry.create_bolt("log").is_ok());
        assert!(registry.create_bolt("validate").is_ok());

        let err = registry.create_spout("kafka").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
        let err = registry.create_bolt("nope").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }

    #[test]
    fn broker_registry_adds_transport_stages() {
        let registry = NodeRegistry::with_broker(InMemoryBroker::new());
        assert!(registry.create_spout("queue").is_ok());
        assert!(registry.create_bolt("forward").is_ok());
    }

    #[test]
    fn custom_registration_overrides() {
        struct NullSpout;

        #[async_trait]
        impl Spout for NullSpout {
            async fn init(&mut self, _name: &str, _config: Value) -> Result<()> {
                Ok(())
            }

            async fn next(&mut self) -> Result<Option<Message>> {
                Ok(None)
            }
        }

        let mut registry = NodeRegistry::new();
        registry.register_spout("null", || Box::new(NullSpout));
        assert!(registry.create_spout("null").is_ok());
    }
}
