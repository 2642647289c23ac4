//! The dispatch engine. Every node runs as an actor owning its stage
//! instance; a mailbox per node is what makes "at most one in-flight
//! receive per node" hold by construction. One dispatch task per spout
//! polls it and walks each message depth-first through the router, so a
//! spout's messages traverse the graph in FIFO order while different
//! spouts make progress concurrently.

use std::sync::Arc;
use std::time::Duration;

use futures::future;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::GeneralSpec;
use crate::error::Error;
use crate::message::{Message, StreamId};
use crate::nodes::{Bolt, Emitter, Spout};
use crate::topology::router::StreamRouter;
use crate::topology::{NodeState, Stage, Topology};

/// How long draining waits for in-flight traversals before aborting them.
const DRAIN_GRACE: Duration = Duration::from_secs(30);
/// Delay before re-polling a spout that had nothing to deliver.
const IDLE_POLL: Duration = Duration::from_millis(10);
/// Delay before re-polling a spout whose poll failed.
const POLL_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAILBOX_CAPACITY: usize = 16;

/// State machine of a whole topology run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopologyState {
    Built,
    Initializing,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug)]
enum SpoutMsg {
    Init {
        config: Value,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Run {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Pause {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Next {
        respond_to: oneshot::Sender<Result<Option<Message>>>,
    },
    Heartbeat,
    Shutdown {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct SpoutActor {
    name: Arc<str>,
    receiver: mpsc::Receiver<SpoutMsg>,
    spout: Box<dyn Spout>,
}

impl SpoutActor {
    async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                SpoutMsg::Init { config, respond_to } => {
                    let _ = respond_to.send(self.spout.init(&self.name, config).await);
                }
                SpoutMsg::Run { respond_to } => {
                    let _ = respond_to.send(self.spout.run().await);
                }
                SpoutMsg::Pause { respond_to } => {
                    let _ = respond_to.send(self.spout.pause().await);
                }
                SpoutMsg::Next { respond_to } => {
                    let _ = respond_to.send(self.spout.next().await);
                }
                SpoutMsg::Heartbeat => {
                    if let Err(e) = self.spout.heartbeat().await {
                        warn!(node = %self.name, err = %e, "heartbeat failed");
                    }
                }
                SpoutMsg::Shutdown { respond_to } => {
                    let _ = respond_to.send(self.spout.shutdown().await);
                    break;
                }
            }
        }
    }
}

#[derive(Clone)]
struct SpoutHandle {
    name: Arc<str>,
    sender: mpsc::Sender<SpoutMsg>,
}

impl SpoutHandle {
    fn spawn(name: Arc<str>, spout: Box<dyn Spout>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = SpoutActor {
            name: Arc::clone(&name),
            receiver,
            spout,
        };
        let task = tokio::spawn(actor.run());
        (Self { name, sender }, task)
    }

    async fn request<T>(&self, msg: impl FnOnce(oneshot::Sender<T>) -> SpoutMsg) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(msg(tx))
            .await
            .map_err(|_| Error::NodeTaskTerminated(self.name.to_string()))?;
        rx.await.map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    async fn init(&self, config: Value) -> Result<()> {
        self.request(|respond_to| SpoutMsg::Init { config, respond_to })
            .await?
    }

    async fn run(&self) -> Result<()> {
        self.request(|respond_to| SpoutMsg::Run { respond_to })
            .await?
    }

    async fn pause(&self) -> Result<()> {
        self.request(|respond_to| SpoutMsg::Pause { respond_to })
            .await?
    }

    async fn next(&self) -> Result<Option<Message>> {
        self.request(|respond_to| SpoutMsg::Next { respond_to })
            .await?
    }

    async fn shutdown(&self) -> Result<()> {
        self.request(|respond_to| SpoutMsg::Shutdown { respond_to })
            .await?
    }
}

#[derive(Debug)]
enum BoltMsg {
    Init {
        config: Value,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Receive {
        message: Message,
        stream: StreamId,
        respond_to: oneshot::Sender<Result<Vec<(Message, StreamId)>>>,
    },
    Heartbeat,
    Shutdown {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct BoltActor {
    name: Arc<str>,
    receiver: mpsc::Receiver<BoltMsg>,
    bolt: Box<dyn Bolt>,
    emitter: Emitter,
}

impl BoltActor {
    async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                BoltMsg::Init { config, respond_to } => {
                    let result = self
                        .bolt
                        .init(&self.name, config, self.emitter.clone())
                        .await;
                    let _ = respond_to.send(result);
                }
                BoltMsg::Receive {
                    message,
                    stream,
                    respond_to,
                } => {
                    let result = self.bolt.receive(message, stream).await;
                    let emissions = self.emitter.drain();
                    let reply = match result {
                        Ok(()) => Ok(emissions),
                        Err(e) => {
                            if !emissions.is_empty() {
                                debug!(
                                    node = %self.name,
                                    count = emissions.len(),
                                    "discarding emissions of a failed receive"
                                );
                            }
                            Err(e)
                        }
                    };
                    let _ = respond_to.send(reply);
                }
                BoltMsg::Heartbeat => {
                    if let Err(e) = self.bolt.heartbeat().await {
                        warn!(node = %self.name, err = %e, "heartbeat failed");
                    }
                }
                BoltMsg::Shutdown { respond_to } => {
                    let _ = respond_to.send(self.bolt.shutdown().await);
                    break;
                }
            }
        }
    }
}

#[derive(Clone)]
struct BoltHandle {
    name: Arc<str>,
    sender: mpsc::Sender<BoltMsg>,
}

impl BoltHandle {
    fn spawn(name: Arc<str>, bolt: Box<dyn Bolt>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = BoltActor {
            name: Arc::clone(&name),
            receiver,
            bolt,
            emitter: Emitter::new(),
        };
        let task = tokio::spawn(actor.run());
        (Self { name, sender }, task)
    }

    async fn request<T>(&self, msg: impl FnOnce(oneshot::Sender<T>) -> BoltMsg) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(msg(tx))
            .await
            .map_err(|_| Error::NodeTaskTerminated(self.name.to_string()))?;
        rx.await.map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    async fn init(&self, config: Value) -> Result<()> {
        self.request(|respond_to| BoltMsg::Init { config, respond_to })
            .await?
    }

    async fn receive(
        &self,
        message: Message,
        stream: StreamId,
    ) -> Result<Vec<(Message, StreamId)>> {
        self.request(|respond_to| BoltMsg::Receive {
            message,
            stream,
            respond_to,
        })
        .await?
    }

    async fn shutdown(&self) -> Result<()> {
        self.request(|respond_to| BoltMsg::Shutdown { respond_to })
            .await?
    }
}

#[derive(Clone)]
enum NodeHandle {
    Spout(SpoutHandle),
    Bolt(BoltHandle),
}

impl NodeHandle {
    fn name(&self) -> &Arc<str> {
        match self {
            NodeHandle::Spout(handle) => &handle.name,
            NodeHandle::Bolt(handle) => &handle.name,
        }
    }

    async fn init(&self, config: Value) -> Result<()> {
        match self {
            NodeHandle::Spout(handle) => handle.init(config).await,
            NodeHandle::Bolt(handle) => handle.init(config).await,
        }
    }

    /// Fire-and-forget; a node busy in a long receive skips the beat
    /// instead of stalling the timer.
    fn heartbeat(&self) {
        let delivered = match self {
            NodeHandle::Spout(handle) => handle.sender.try_send(SpoutMsg::Heartbeat).is_ok(),
            NodeHandle::Bolt(handle) => handle.sender.try_send(BoltMsg::Heartbeat).is_ok(),
        };
        if !delivered {
            debug!(node = %self.name(), "heartbeat skipped");
        }
    }

    async fn shutdown(&self) -> Result<()> {
        match self {
            NodeHandle::Spout(handle) => handle.shutdown().await,
            NodeHandle::Bolt(handle) => handle.shutdown().await,
        }
    }
}

/// Everything a dispatch task needs to walk a message through the graph.
struct DispatchShared {
    router: StreamRouter,
    handles: Vec<NodeHandle>,
    terminal: Vec<bool>,
}

/// Drives a built [Topology] through init, dispatch, drain and shutdown.
pub struct TopologyRunner {
    general: GeneralSpec,
    shared: Arc<DispatchShared>,
    inits: Vec<Value>,
    states: Vec<NodeState>,
    actor_tasks: Vec<JoinHandle<()>>,
    state: TopologyState,
}

impl TopologyRunner {
    /// Wrap every node of the topology in its actor. Nothing is initialized
    /// yet; that happens inside [Self::run].
    pub fn new(topology: Topology) -> Self {
        let Topology {
            general,
            nodes,
            router,
        } = topology;

        let mut handles = Vec::with_capacity(nodes.len());
        let mut inits = Vec::with_capacity(nodes.len());
        let mut terminal = Vec::with_capacity(nodes.len());
        let mut actor_tasks = Vec::with_capacity(nodes.len());
        let mut states = Vec::with_capacity(nodes.len());

        for seed in nodes {
            inits.push(seed.init);
            terminal.push(seed.terminal);
            states.push(NodeState::Created);
            match seed.stage {
                Stage::Spout(spout) => {
                    let (handle, task) = SpoutHandle::spawn(seed.name, spout);
                    handles.push(NodeHandle::Spout(handle));
                    actor_tasks.push(task);
                }
                Stage::Bolt(bolt) => {
                    let (handle, task) = BoltHandle::spawn(seed.name, bolt);
                    handles.push(NodeHandle::Bolt(handle));
                    actor_tasks.push(task);
                }
            }
        }

        Self {
            general,
            shared: Arc::new(DispatchShared {
                router,
                handles,
                terminal,
            }),
            inits,
            states,
            actor_tasks,
            state: TopologyState::Built,
        }
    }

    /// Full lifecycle: init every node in topological order, dispatch until
    /// the token fires, then drain in-flight traversals and shut everything
    /// down in reverse topological order.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(nodes = self.shared.handles.len(), "starting topology");
        if self.general.pass_binary_messages {
            info!("pass_binary_messages is set; in-process delivery ignores it");
        }
        let has_spouts = self
            .shared
            .handles
            .iter()
            .any(|handle| matches!(handle, NodeHandle::Spout(_)));
        if !has_spouts {
            warn!("topology has no spouts, nothing will be produced");
        }

        if let Err(e) = self.initialize().await {
            self.join_actors().await;
            self.transition(TopologyState::Stopped);
            return Err(e);
        }

        let (dispatch_tasks, heartbeat_task) = match self.start_dispatch(&cancel).await {
            Ok(tasks) => tasks,
            Err(e) => {
                self.shutdown_nodes().await;
                self.join_actors().await;
                self.transition(TopologyState::Stopped);
                return Err(e);
            }
        };

        cancel.cancelled().await;

        self.drain(dispatch_tasks).await;
        let _ = heartbeat_task.await;
        self.shutdown_nodes().await;
        self.join_actors().await;
        self.transition(TopologyState::Stopped);
        info!("topology stopped");
        Ok(())
    }

    fn transition(&mut self, to: TopologyState) {
        debug!(from = ?self.state, to = ?to, "topology state change");
        self.state = to;
    }

    fn set_node_state(&mut self, index: usize, to: NodeState) {
        if let Some(state) = self.states.get_mut(index) {
            *state = to;
        }
        if let Some(handle) = self.shared.handles.get(index) {
            debug!(node = %handle.name(), state = ?to, "node state change");
        }
    }

    /// Init every node in topological order, so each bolt's sources come up
    /// first. The first failure rolls back everything initialized so far;
    /// no partially-initialized topology is ever left standing.
    async fn initialize(&mut self) -> Result<()> {
        self.transition(TopologyState::Initializing);
        for index in 0..self.shared.handles.len() {
            let handle = self.shared.handles[index].clone();
            let config = self.inits[index].clone();
            match handle.init(config).await {
                Ok(()) => {
                    debug!(node = %handle.name(), "node initialized");
                    self.set_node_state(index, NodeState::Initialized);
                }
                Err(e) => {
                    let node = handle.name().to_string();
                    error!(node = %node, err = %e, "node init failed, rolling back");
                    self.rollback(index).await;
                    return Err(Error::NodeInit {
                        node,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Best-effort shutdown of the nodes initialized before `failed`, in
    /// reverse order.
    async fn rollback(&mut self, failed: usize) {
        for index in (0..failed).rev() {
            let handle = self.shared.handles[index].clone();
            self.set_node_state(index, NodeState::ShuttingDown);
            if let Err(e) = handle.shutdown().await {
                error!(node = %handle.name(), err = %e, "shutdown during rollback failed");
            }
            self.set_node_state(index, NodeState::Stopped);
        }
    }

    /// Tell every spout to start producing, then spawn the heartbeat timer
    /// and one dispatch loop per spout. A spout that refuses to run is as
    /// fatal as one that failed init.
    async fn start_dispatch(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(Vec<JoinHandle<()>>, JoinHandle<()>)> {
        self.transition(TopologyState::Running);

        for index in 0..self.shared.handles.len() {
            if let NodeHandle::Spout(handle) = &self.shared.handles[index] {
                let handle = handle.clone();
                handle.run().await.map_err(|e| Error::NodeInit {
                    node: handle.name.to_string(),
                    reason: format!("run: {e}"),
                })?;
            }
            self.set_node_state(index, NodeState::Running);
        }

        let heartbeat_task = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.shared),
            self.general.heartbeat_interval(),
            cancel.clone(),
        ));

        let mut dispatch_tasks = Vec::new();
        for index in 0..self.shared.handles.len() {
            if let NodeHandle::Spout(handle) = &self.shared.handles[index] {
                dispatch_tasks.push(tokio::spawn(spout_loop(
                    index,
                    handle.clone(),
                    Arc::clone(&self.shared),
                    cancel.clone(),
                )));
            }
        }
        Ok((dispatch_tasks, heartbeat_task))
    }

    /// Stop admitting new messages, then wait for the dispatch loops to
    /// finish their in-flight traversals.
    async fn drain(&mut self, dispatch_tasks: Vec<JoinHandle<()>>) {
        self.transition(TopologyState::Draining);
        for index in 0..self.shared.handles.len() {
            let NodeHandle::Spout(handle) = self.shared.handles[index].clone() else {
                continue;
            };
            if let Err(e) = handle.pause().await {
                warn!(node = %handle.name, err = %e, "pause on drain failed");
            }
            self.set_node_state(index, NodeState::Paused);
        }

        let aborts: Vec<_> = dispatch_tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(DRAIN_GRACE, future::join_all(dispatch_tasks))
            .await
            .is_err()
        {
            warn!("drain grace elapsed, aborting remaining dispatch");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    /// Reverse topological order: a sink releases its resources only after
    /// everything upstream of it has stopped calling. Failures are logged
    /// and never block the remaining shutdowns.
    async fn shutdown_nodes(&mut self) {
        for index in (0..self.shared.handles.len()).rev() {
            let handle = self.shared.handles[index].clone();
            self.set_node_state(index, NodeState::ShuttingDown);
            if let Err(e) = handle.shutdown().await {
                let err = Error::NodeShutdown {
                    node: handle.name().to_string(),
                    reason: e.to_string(),
                };
                error!(err = %err, "node shutdown failed");
            }
            self.set_node_state(index, NodeState::Stopped);
        }
    }

    async fn join_actors(&mut self) {
        // dropping the dispatch handles closes every mailbox
        self.shared = Arc::new(DispatchShared {
            router: StreamRouter::new(0),
            handles: Vec::new(),
            terminal: Vec::new(),
        });
        for task in self.actor_tasks.drain(..) {
            if let Err(e) = task.await
                && e.is_panic()
            {
                error!(err = %e, "node task panicked");
            }
        }
    }
}

async fn heartbeat_loop(shared: Arc<DispatchShared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick of an interval fires immediately, skip it
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for handle in &shared.handles {
                    handle.heartbeat();
                }
            }
        }
    }
}

/// Poll one spout until cancellation. Each message runs through the graph
/// to completion before the next poll, keeping that spout's stream FIFO.
async fn spout_loop(
    source: usize,
    spout: SpoutHandle,
    shared: Arc<DispatchShared>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match spout.next().await {
            Ok(Some(message)) => {
                // finish the traversal even if cancellation arrives now;
                // drain relies on in-flight messages completing
                route(&shared, source, message, StreamId::Default).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
            Err(e) => {
                // steady-state transport recovery belongs to the client;
                // back off and keep polling
                warn!(node = %spout.name, err = %e, "spout poll failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_RETRY_BACKOFF) => {}
                }
            }
        }
    }
}

/// Deliver a message to every subscriber of `(source, stream)`, deep-copied
/// per destination, then route whatever those deliveries emit.
async fn route(shared: &Arc<DispatchShared>, source: usize, message: Message, stream: StreamId) {
    let destinations = shared.router.resolve(source, &stream);
    if destinations.is_empty() {
        let name = shared.handles.get(source).map(|h| h.name().as_ref());
        debug!(
            source = name.unwrap_or("?"),
            stream = %stream,
            id = %message.id,
            "stream has no subscribers, dropping message"
        );
        return;
    }
    let copies = StreamRouter::copies(message, destinations.len());
    for (destination, copy) in destinations.iter().copied().zip(copies) {
        deliver(shared, destination, copy, stream.clone()).await;
    }
}

async fn deliver(
    shared: &Arc<DispatchShared>,
    destination: usize,
    message: Message,
    stream: StreamId,
) {
    let Some(NodeHandle::Bolt(bolt)) = shared.handles.get(destination) else {
        // the graph builder only ever subscribes bolts
        debug!(destination, "subscriber is not a bolt, dropping message");
        return;
    };
    let message_id = message.id.clone();
    match bolt.receive(message, stream).await {
        Ok(emissions) => {
            if shared.terminal.get(destination).copied().unwrap_or(false) {
                if !emissions.is_empty() {
                    debug!(
                        node = %bolt.name,
                        count = emissions.len(),
                        "discarding emissions of a final bolt"
                    );
                }
                return;
            }
            for (next_message, next_stream) in emissions {
                Box::pin(route(shared, destination, next_message, next_stream)).await;
            }
        }
        Err(e) => {
            // contained to this one message: log, drop, keep the topology
            // running
            error!(
                node = %bolt.name,
                id = %message_id,
                err = %e,
                "receive failed, dropping message"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::config::TopologyDefinition;
    use crate::nodes::NodeRegistry;
    use crate::transport::inmem::InMemoryBroker;

    /// Records every lifecycle and data event across the test topology.
    type Probe = Arc<Mutex<Vec<String>>>;

    struct ScriptedSpout {
        bodies: VecDeque<Value>,
        running: bool,
        probe: Probe,
        fail_init: bool,
        seq: u64,
        name: String,
    }

    impl ScriptedSpout {
        fn factory(
            bodies: Vec<Value>,
            probe: Probe,
            fail_init: bool,
        ) -> impl Fn() -> Box<dyn Spout> + Send + Sync + 'static {
            move || {
                Box::new(ScriptedSpout {
                    bodies: bodies.clone().into(),
                    running: false,
                    probe: Arc::clone(&probe),
                    fail_init,
                    seq: 0,
                    name: String::new(),
                })
            }
        }
    }

    #[async_trait]
    impl Spout for ScriptedSpout {
        async fn init(&mut self, name: &str, _config: Value) -> Result<()> {
            self.name = name.to_string();
            if self.fail_init {
                return Err(Error::Transport("scripted init failure".into()));
            }
            self.probe.lock().push(format!("init:{name}"));
            Ok(())
        }

        async fn run(&mut self) -> Result<()> {
            self.running = true;
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
            Ok(self.bodies.pop_front().map(|body| {
                self.seq += 1;
                Message::new(self.name.clone(), self.seq, body)
            }))
        }

        async fn heartbeat(&mut self) -> Result<()> {
            self.probe.lock().push(format!("heartbeat:{}", self.name));
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.probe.lock().push(format!("shutdown:{}", self.name));
            Ok(())
        }
    }

    /// Bolt scripted per body: fails on `{"fail": true}`, emits everything
    /// else onward after tagging it, recording what it saw.
    struct RecordingBolt {
        name: String,
        emitter: Emitter,
        probe: Probe,
        terminal: bool,
        tag: Option<(String, Value)>,
        emit_stream: Option<StreamId>,
    }

    impl RecordingBolt {
        fn factory(
            probe: Probe,
            tag: Option<(String, Value)>,
            emit_stream: Option<StreamId>,
        ) -> impl Fn() -> Box<dyn Bolt> + Send + Sync + 'static {
            move || {
                Box::new(RecordingBolt {
                    name: String::new(),
                    emitter: Emitter::new(),
                    probe: Arc::clone(&probe),
                    terminal: false,
                    tag: tag.clone(),
                    emit_stream: emit_stream.clone(),
                })
            }
        }
    }

    #[async_trait]
    impl Bolt for RecordingBolt {
        async fn init(&mut self, name: &str, config: Value, emitter: Emitter) -> Result<()> {
            self.name = name.to_string();
            self.terminal = config.get("final") == Some(&Value::Bool(true));
            self.emitter = emitter;
            self.probe.lock().push(format!("init:{name}"));
            Ok(())
        }

        async fn receive(&mut self, mut message: Message, stream: StreamId) -> Result<()> {
            if message.get_path("fail") == Some(&Value::Bool(true)) {
                return Err(Error::Processing("scripted receive failure".into()));
            }
            if let Some((path, value)) = &self.tag {
                message.set_path(path, value.clone());
            }
            self.probe
                .lock()
                .push(format!("receive:{}:{}", self.name, message.body));
            if !self.terminal {
                let out = self.emit_stream.clone().unwrap_or(stream);
                self.emitter.emit(message, out);
            }
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.probe.lock().push(format!("shutdown:{}", self.name));
            Ok(())
        }
    }

    fn definition(raw: &str) -> TopologyDefinition {
        TopologyDefinition::from_json(raw).unwrap()
    }

    async fn wait_for(probe: &Probe, pred: impl Fn(&[String]) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pred(&probe.lock()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("condition not reached, probe: {:?}", probe.lock()));
    }

    fn received_bodies(probe: &Probe, node: &str) -> Vec<String> {
        let prefix = format!("receive:{node}:");
        probe
            .lock()
            .iter()
            .filter_map(|event| event.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn end_to_end_single_message() {
        let probe: Probe = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NodeRegistry::new();
        registry.register_spout(
            "scripted",
            ScriptedSpout::factory(vec![json!({"id": 1})], Arc::clone(&probe), false),
        );
        registry.register_bolt(
            "seen-marker",
            RecordingBolt::factory(Arc::clone(&probe), Some(("seen".into(), json!(true))), None),
        );

        let topology = Topology::build(
            &definition(
                r#"{
                    "general": { "heartbeat": 60000 },
                    "spouts": [ { "name": "s", "type": "scripted" } ],
                    "bolts": [
                        {
                            "name": "b", "type": "seen-marker", "final": true,
                            "inputs": [ { "source": "s" } ]
                        }
                    ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(TopologyRunner::new(topology).run(cancel.clone()));

        wait_for(&probe, |events| {
            events.iter().any(|e| e.starts_with("receive:b:"))
        })
        .await;
        // give the spout a couple more polls to prove it is exhausted
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        runner_task.await.unwrap().unwrap();

        let bodies = received_bodies(&probe, "b");
        assert_eq!(bodies, [r#"{"id":1,"seen":true}"#]);
    }

    #[tokio::test]
    async fn fifo_through_a_straight_chain() {
        let probe: Probe = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NodeRegistry::new();
        registry.register_spout(
            "scripted",
            ScriptedSpout::factory(
                vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
                Arc::clone(&probe),
                false,
            ),
        );
        registry.register_bolt(
            "pass",
            RecordingBolt::factory(Arc::clone(&probe), None, None),
        );

        let topology = Topology::build(
            &definition(
                r#"{
                    "general": { "heartbeat": 60000 },
                    "spouts": [ { "name": "s", "type": "scripted" } ],
                    "bolts": [
                        { "name": "mid", "type": "pass", "inputs": [ { "source": "s" } ] },
                        {
                            "name": "sink", "type": "pass", "final": true,
                            "inputs": [ { "source": "mid" } ]
                        }
                    ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(TopologyRunner::new(topology).run(cancel.clone()));

        wait_for(&probe, |events| {
            events
                .iter()
                .filter(|e| e.starts_with("receive:sink:"))
                .count()
                == 3
        })
        .await;
        cancel.cancel();
        runner_task.await.unwrap().unwrap();

        assert_eq!(
            received_bodies(&probe, "sink"),
            [r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]
        );
    }

    #[tokio::test]
    async fn fan_out_copies_stay_isolated() {
        let probe: Probe = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NodeRegistry::new();
        registry.register_spout(
            "scripted",
            ScriptedSpout::factory(vec![json!({"doc": {}})], Arc::clone(&probe), false),
        );
        registry.register_bolt(
            "tag-left",
            RecordingBolt::factory(Arc::clone(&probe), Some(("doc.left".into(), json!(1))), None),
        );
        registry.register_bolt(
            "tag-right",
            RecordingBolt::factory(Arc::clone(&probe), Some(("doc.right".into(), json!(2))), None),
        );

        let topology = Topology::build(
            &definition(
                r#"{
                    "general": { "heartbeat": 60000 },
                    "spouts": [ { "name": "s", "type": "scripted" } ],
                    "bolts": [
                        {
                            "name": "left", "type": "tag-left", "final": true,
                            "inputs": [ { "source": "s" } ]
                        },
                        {
                            "name": "right", "type": "tag-right", "final": true,
                            "inputs": [ { "source": "s" } ]
                        }
                    ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(TopologyRunner::new(topology).run(cancel.clone()));

        wait_for(&probe, |events| {
            events.iter().any(|e| e.starts_with("receive:left:"))
                && events.iter().any(|e| e.starts_with("receive:right:"))
        })
        .await;
        cancel.cancel();
        runner_task.await.unwrap().unwrap();

        // each side saw only its own mutation
        assert_eq!(received_bodies(&probe, "left"), [r#"{"doc":{"left":1}}"#]);
        assert_eq!(received_bodies(&probe, "right"), [r#"{"doc":{"right":2}}"#]);
    }

    #[tokio::test]
    async fn receive_failure_drops_only_that_message() {
        let probe: Probe = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NodeRegistry::new();
        registry.register_spout(
            "scripted",
            ScriptedSpout::factory(
                vec![json!({"fail": true}), json!({"n": 2})],
                Arc::clone(&probe),
                false,
            ),
        );
        registry.register_bolt(
            "pass",
            RecordingBolt::factory(Arc::clone(&probe), None, None),
        );

        let topology = Topology::build(
            &definition(
                r#"{
                    "general": { "heartbeat": 60000 },
                    "spouts": [ { "name": "s", "type": "scripted" } ],
                    "bolts": [
                        {
                            "name": "sink", "type": "pass", "final": true,
                            "inputs": [ { "source": "s" } ]
                        }
                    ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(TopologyRunner::new(topology).run(cancel.clone()));

        wait_for(&probe, |events| {
            events.iter().any(|e| e == r#"receive:sink:{"n":2}"#)
        })
        .await;
        cancel.cancel();
        runner_task.await.unwrap().unwrap();

        // the failing message never reached the record, the next one did
        assert_eq!(received_bodies(&probe, "sink"), [r#"{"n":2}"#]);
    }

    #[tokio::test]
    async fn error_stream_reaches_its_subscriber() {
        let probe: Probe = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NodeRegistry::new();
        registry.register_spout(
            "scripted",
            ScriptedSpout::factory(vec![json!({"n": 1})], Arc::clone(&probe), false),
        );
        registry.register_bolt(
            "diverter",
            RecordingBolt::factory(Arc::clone(&probe), None, Some(StreamId::Error)),
        );
        registry.register_bolt(
            "pass",
            RecordingBolt::factory(Arc::clone(&probe), None, None),
        );

        let topology = Topology::build(
            &definition(
                r#"{
                    "general": { "heartbeat": 60000 },
                    "spouts": [ { "name": "s", "type": "scripted" } ],
                    "bolts": [
                        { "name": "divert", "type": "diverter", "inputs": [ { "source": "s" } ] },
                        {
                            "name": "normal", "type": "pass", "final": true,
                            "inputs": [ { "source": "divert" } ]
                        },
                        {
                            "name": "failures", "type": "pass", "final": true,
                            "inputs": [ { "source": "divert", "stream_id": "stream_error" } ]
                        }
                    ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(TopologyRunner::new(topology).run(cancel.clone()));

        wait_for(&probe, |events| {
            events.iter().any(|e| e.starts_with("receive:failures:"))
        })
        .await;
        cancel.cancel();
        runner_task.await.unwrap().unwrap();

        assert_eq!(received_bodies(&probe, "failures"), [r#"{"n":1}"#]);
        assert!(received_bodies(&probe, "normal").is_empty());
    }

    #[tokio::test]
    async fn unresolved_stream_is_a_noop() {
        let probe: Probe = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NodeRegistry::new();
        registry.register_spout(
            "scripted",
            ScriptedSpout::factory(
                vec![json!({"n": 1}), json!({"n": 2})],
                Arc::clone(&probe),
                false,
            ),
        );
        registry.register_bolt(
            "dead-end",
            RecordingBolt::factory(
                Arc::clone(&probe),
                None,
                Some(StreamId::Named("unwired".into())),
            ),
        );

        let topology = Topology::build(
            &definition(
                r#"{
                    "general": { "heartbeat": 60000 },
                    "spouts": [ { "name": "s", "type": "scripted" } ],
                    "bolts": [
                        { "name": "emitter", "type": "dead-end", "inputs": [ { "source": "s" } ] }
                    ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(TopologyRunner::new(topology).run(cancel.clone()));

        // both messages pass through the emitting bolt without anything
        // downstream; no error, no stall
        wait_for(&probe, |events| {
            events
                .iter()
                .filter(|e| e.starts_with("receive:emitter:"))
                .count()
                == 2
        })
        .await;
        cancel.cancel();
        runner_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn init_failure_rolls_back_initialized_nodes() {
        let probe: Probe = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NodeRegistry::new();
        registry.register_spout(
            "scripted",
            ScriptedSpout::factory(vec![json!({"n": 1})], Arc::clone(&probe), false),
        );
        registry.register_bolt(
            "pass",
            RecordingBolt::factory(Arc::clone(&probe), None, None),
        );
        registry.register_bolt("explodes", {
            struct FailingBolt;

            #[async_trait]
            impl Bolt for FailingBolt {
                async fn init(&mut self, _: &str, _: Value, _: Emitter) -> Result<()> {
                    Err(Error::Transport("no pool available".into()))
                }

                async fn receive(&mut self, _: Message, _: StreamId) -> Result<()> {
                    Ok(())
                }
            }
            || Box::new(FailingBolt) as Box<dyn Bolt>
        });

        let topology = Topology::build(
            &definition(
                r#"{
                    "spouts": [ { "name": "s", "type": "scripted" } ],
                    "bolts": [
                        { "name": "ok", "type": "pass", "inputs": [ { "source": "s" } ] },
                        { "name": "bad", "type": "explodes", "inputs": [ { "source": "ok" } ] },
                        {
                            "name": "after", "type": "pass", "final": true,
                            "inputs": [ { "source": "bad" } ]
                        }
                    ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let err = TopologyRunner::new(topology)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeInit { ref node, .. } if node == "bad"), "{err:?}");

        let events = probe.lock().clone();
        // the nodes before the failure were initialized and rolled back,
        // the one after it was never touched
        assert!(events.contains(&"init:s".to_string()));
        assert!(events.contains(&"init:ok".to_string()));
        assert!(events.contains(&"shutdown:ok".to_string()));
        assert!(events.contains(&"shutdown:s".to_string()));
        assert!(!events.contains(&"init:after".to_string()));
        // nothing was ever dispatched
        assert!(!events.iter().any(|e| e.starts_with("receive:")));
    }

    #[tokio::test]
    async fn shutdown_runs_sinks_before_sources() {
        let probe: Probe = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NodeRegistry::new();
        registry.register_spout(
            "scripted",
            ScriptedSpout::factory(vec![json!({"n": 1})], Arc::clone(&probe), false),
        );
        registry.register_bolt(
            "pass",
            RecordingBolt::factory(Arc::clone(&probe), None, None),
        );

        let topology = Topology::build(
            &definition(
                r#"{
                    "general": { "heartbeat": 60000 },
                    "spouts": [ { "name": "s", "type": "scripted" } ],
                    "bolts": [
                        { "name": "a", "type": "pass", "inputs": [ { "source": "s" } ] },
                        {
                            "name": "b", "type": "pass", "final": true,
                            "inputs": [ { "source": "a" } ]
                        }
                    ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(TopologyRunner::new(topology).run(cancel.clone()));

        wait_for(&probe, |events| {
            events.iter().any(|e| e.starts_with("receive:b:"))
        })
        .await;
        cancel.cancel();
        runner_task.await.unwrap().unwrap();

        let events = probe.lock().clone();
        let shutdowns: Vec<&str> = events
            .iter()
            .filter(|e| e.starts_with("shutdown:"))
            .map(String::as_str)
            .collect();
        assert_eq!(shutdowns, ["shutdown:b", "shutdown:a", "shutdown:s"]);

        // the sink's shutdown came after its last receive
        let last_receive = events
            .iter()
            .rposition(|e| e.starts_with("receive:b:"))
            .unwrap();
        let sink_shutdown = events.iter().position(|e| e == "shutdown:b").unwrap();
        assert!(last_receive < sink_shutdown);
    }

    #[tokio::test]
    async fn heartbeats_tick_without_traffic() {
        let probe: Probe = Arc::new(Mutex::new(Vec::new()));
        let mut registry = NodeRegistry::new();
        registry.register_spout(
            "scripted",
            ScriptedSpout::factory(Vec::new(), Arc::clone(&probe), false),
        );

        let topology = Topology::build(
            &definition(
                r#"{
                    "general": { "heartbeat": 25 },
                    "spouts": [ { "name": "quiet", "type": "scripted" } ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(TopologyRunner::new(topology).run(cancel.clone()));

        wait_for(&probe, |events| {
            events.iter().filter(|e| *e == "heartbeat:quiet").count() >= 2
        })
        .await;
        cancel.cancel();
        runner_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn builtin_pipeline_over_in_memory_broker() {
        // queue spout -> validate -> forward, driven entirely by builtins
        let broker = InMemoryBroker::new();
        broker.publish("raw", bytes::Bytes::from_static(br#"{"doc":{"url":"http://a"}}"#));
        broker.publish("raw", bytes::Bytes::from_static(br#"{"doc":{}}"#));

        let registry = NodeRegistry::with_broker(broker.clone());
        let topology = Topology::build(
            &definition(
                r#"{
                    "general": { "heartbeat": 60000 },
                    "spouts": [
                        {
                            "name": "ingest", "type": "queue",
                            "init": { "topic": "raw", "high_water": 10, "low_water": 0 }
                        }
                    ],
                    "bolts": [
                        {
                            "name": "check", "type": "validate",
                            "init": { "required": ["doc.url"] },
                            "inputs": [ { "source": "ingest" } ]
                        },
                        {
                            "name": "accepted", "type": "forward", "final": true,
                            "init": { "topic": "good" },
                            "inputs": [ { "source": "check" } ]
                        },
                        {
                            "name": "rejected", "type": "forward", "final": true,
                            "init": { "topic": "bad" },
                            "inputs": [ { "source": "check", "stream_id": "stream_error" } ]
                        }
                    ]
                }"#,
            ),
            &registry,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner_task = tokio::spawn(TopologyRunner::new(topology).run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.depth("good") < 1 || broker.depth("bad") < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pipeline did not deliver to both topics");

        cancel.cancel();
        runner_task.await.unwrap().unwrap();

        let good = broker.drain("good", 10);
        let accepted: Value = serde_json::from_slice(&good[0]).unwrap();
        assert_eq!(accepted, json!({"doc":{"url":"http://a"}}));

        let bad = broker.drain("bad", 10);
        let rejected: Value = serde_json::from_slice(&bad[0]).unwrap();
        assert_eq!(rejected.get("doc"), Some(&json!({})));
        assert!(rejected.get("error").is_some(), "{rejected}");
    }
}
