//! Topology graph assembly. A [TopologyDefinition] is validated and turned
//! into the runtime node set exactly once: name uniqueness, resolvable
//! inputs and acyclicity are all build-time concerns, never runtime states.
//! The node list comes out in topological order (spouts first, then bolts in
//! input-dependency order) so init can run sources-before-consumers and
//! shutdown the reverse.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::Result;
use crate::config::{GeneralSpec, TopologyDefinition};
use crate::error::Error;
use crate::nodes::{Bolt, NodeRegistry, Spout};
use crate::topology::router::StreamRouter;

pub mod router;
pub mod runner;

/// Runtime lifecycle of one node. Never resurrected once stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Initialized,
    Running,
    Paused,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Spout,
    Bolt,
}

pub(crate) enum Stage {
    Spout(Box<dyn Spout>),
    Bolt(Box<dyn Bolt>),
}

/// One node ready to be wrapped and scheduled: identity, its opaque init
/// payload, and the not-yet-initialized stage instance.
pub(crate) struct NodeSeed {
    pub(crate) name: Arc<str>,
    pub(crate) terminal: bool,
    pub(crate) init: Value,
    pub(crate) stage: Stage,
}

/// The built graph: general options, seeds in topological order and the
/// immutable edge table over those positions.
pub struct Topology {
    pub(crate) general: GeneralSpec,
    pub(crate) nodes: Vec<NodeSeed>,
    pub(crate) router: StreamRouter,
}

impl Topology {
    /// Validate the definition and instantiate every stage from the
    /// registry. Any failure here aborts before a single node is
    /// initialized.
    pub fn build(definition: &TopologyDefinition, registry: &NodeRegistry) -> Result<Self> {
        let order = validate_and_sort(definition)?;

        // definition position -> topological position
        let mut topo_position = HashMap::new();
        for (position, entry) in order.iter().enumerate() {
            topo_position.insert(entry.name.clone(), position);
        }

        let mut router = StreamRouter::new(order.len());
        for bolt in &definition.bolts {
            let destination = topo_position[bolt.name.as_str()];
            for input in &bolt.inputs {
                let source = topo_position[input.source.as_str()];
                router.subscribe(source, input.stream(), destination);
            }
        }

        let mut nodes = Vec::with_capacity(order.len());
        for entry in order {
            nodes.push(instantiate(definition, entry, registry)?);
        }

        Ok(Self {
            general: definition.general.clone(),
            nodes,
            router,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node names in topological order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_ref()).collect()
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("nodes", &self.node_names())
            .finish_non_exhaustive()
    }
}

struct OrderEntry {
    name: String,
    kind: NodeKind,
    // position within definition.spouts / definition.bolts
    index: usize,
}

/// Check names, inputs and acyclicity, returning the nodes in topological
/// order via Kahn's algorithm. Ties keep definition order: spouts in
/// declaration order first, then bolts as their dependencies complete.
fn validate_and_sort(definition: &TopologyDefinition) -> Result<Vec<OrderEntry>> {
    let total = definition.spouts.len() + definition.bolts.len();

    // name -> definition slot, also catches duplicates
    let mut slots: HashMap<&str, OrderEntry> = HashMap::with_capacity(total);
    let mut declared: Vec<&str> = Vec::with_capacity(total);
    for (index, spout) in definition.spouts.iter().enumerate() {
        let entry = OrderEntry {
            name: spout.name.clone(),
            kind: NodeKind::Spout,
            index,
        };
        if slots.insert(&spout.name, entry).is_some() {
            return Err(Error::Topology(format!(
                "duplicate node name {:?}",
                spout.name
            )));
        }
        declared.push(&spout.name);
    }
    for (index, bolt) in definition.bolts.iter().enumerate() {
        let entry = OrderEntry {
            name: bolt.name.clone(),
            kind: NodeKind::Bolt,
            index,
        };
        if slots.insert(&bolt.name, entry).is_some() {
            return Err(Error::Topology(format!(
                "duplicate node name {:?}",
                bolt.name
            )));
        }
        declared.push(&bolt.name);
    }

    // edges: source name -> subscriber names, adjacency over definition slots
    let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut indegree: HashMap<&str, usize> = declared.iter().map(|name| (*name, 0)).collect();
    for bolt in &definition.bolts {
        if bolt.inputs.is_empty() {
            return Err(Error::Topology(format!(
                "bolt {:?} has no inputs",
                bolt.name
            )));
        }
        for input in &bolt.inputs {
            if !slots.contains_key(input.source.as_str()) {
                return Err(Error::Topology(format!(
                    "bolt {:?} references undefined source {:?}",
                    bolt.name, input.source
                )));
            }
            downstream
                .entry(input.source.as_str())
                .or_default()
                .push(&bolt.name);
            if let Some(count) = indegree.get_mut(bolt.name.as_str()) {
                *count += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = declared
        .iter()
        .copied()
        .filter(|name| indegree.get(name) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(total);
    while let Some(name) = queue.pop_front() {
        if let Some(entry) = slots.remove(name) {
            order.push(entry);
        }
        for subscriber in downstream.get(name).into_iter().flatten().copied() {
            if let Some(count) = indegree.get_mut(subscriber) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(subscriber);
                }
            }
        }
    }

    if order.len() != total {
        // everything left in `slots` sits on a cycle
        let mut blocked: Vec<&str> = slots.keys().copied().collect();
        blocked.sort_unstable();
        return Err(Error::Topology(format!(
            "cyclic topology, nodes on a cycle: {}",
            blocked.join(", ")
        )));
    }
    Ok(order)
}

fn instantiate(
    definition: &TopologyDefinition,
    entry: OrderEntry,
    registry: &NodeRegistry,
) -> Result<NodeSeed> {
    match entry.kind {
        NodeKind::Spout => {
            let spec = &definition.spouts[entry.index];
            Ok(NodeSeed {
                name: Arc::from(spec.name.as_str()),
                terminal: false,
                init: spec.init.clone(),
                stage: Stage::Spout(registry.create_spout(&spec.kind)?),
            })
        }
        NodeKind::Bolt => {
            let spec = &definition.bolts[entry.index];
            // the spec-level flag and an explicit `final` inside the init
            // payload are equivalent; the effective value is injected back
            // so the stage sees what the engine will enforce
            let terminal =
                spec.terminal || spec.init.get("final") == Some(&Value::Bool(true));
            let mut init = spec.init.clone();
            if let Value::Object(map) = &mut init {
                map.insert("final".to_string(), Value::Bool(terminal));
            }
            Ok(NodeSeed {
                name: Arc::from(spec.name.as_str()),
                terminal,
                init,
                stage: Stage::Bolt(registry.create_bolt(&spec.kind)?),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyDefinition;

    fn build(raw: &str) -> Result<Topology> {
        let definition = TopologyDefinition::from_json(raw).unwrap();
        Topology::build(&definition, &NodeRegistry::builtin())
    }

    #[test]
    fn valid_definition_builds_one_node_per_spec() {
        let topology = build(
            r#"{
                "spouts": [ { "name": "in", "type": "generator" } ],
                "bolts": [
                    {
                        "name": "shape", "type": "transform",
                        "inputs": [ { "source": "in" } ]
                    },
                    {
                        "name": "audit", "type": "log", "final": true,
                        "inputs": [ { "source": "shape" } ]
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(topology.node_count(), 3);
        assert_eq!(topology.node_names(), ["in", "shape", "audit"]);
    }

    #[test]
    fn topological_order_respects_dependencies() {
        // declared out of dependency order on purpose
        let topology = build(
            r#"{
                "spouts": [ { "name": "src", "type": "generator" } ],
                "bolts": [
                    {
                        "name": "last", "type": "log", "final": true,
                        "inputs": [ { "source": "mid" }, { "source": "first" } ]
                    },
                    {
                        "name": "mid", "type": "transform",
                        "inputs": [ { "source": "first" } ]
                    },
                    {
                        "name": "first", "type": "transform",
                        "inputs": [ { "source": "src" } ]
                    }
                ]
            }"#,
        )
        .unwrap();

        let names = topology.node_names();
        let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert_eq!(position("src"), 0);
        assert!(position("first") < position("mid"));
        assert!(position("mid") < position("last"));
    }

    #[test]
    fn duplicate_name_rejected() {
        let err = build(
            r#"{
                "spouts": [
                    { "name": "same", "type": "generator" },
                    { "name": "same", "type": "generator" }
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Topology(_)), "{err:?}");
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn dangling_reference_rejected() {
        let err = build(
            r#"{
                "spouts": [ { "name": "in", "type": "generator" } ],
                "bolts": [
                    {
                        "name": "audit", "type": "log",
                        "inputs": [ { "source": "ghost" } ]
                    }
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Topology(_)), "{err:?}");
        assert!(err.to_string().contains("ghost"), "{err}");
    }

    #[test]
    fn cycle_rejected() {
        let err = build(
            r#"{
                "spouts": [ { "name": "in", "type": "generator" } ],
                "bolts": [
                    {
                        "name": "a", "type": "transform",
                        "inputs": [ { "source": "in" }, { "source": "b" } ]
                    },
                    {
                        "name": "b", "type": "transform",
                        "inputs": [ { "source": "a" } ]
                    }
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Topology(_)), "{err:?}");
        assert!(err.to_string().contains("cyclic"), "{err}");
    }

    #[test]
    fn bolt_without_inputs_rejected() {
        let err = build(
            r#"{
                "spouts": [ { "name": "in", "type": "generator" } ],
                "bolts": [ { "name": "floating", "type": "log", "inputs": [] } ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Topology(_)), "{err:?}");
    }

    #[test]
    fn unknown_node_type_rejected() {
        let err = build(r#"{ "spouts": [ { "name": "in", "type": "martian" } ] }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }

    #[test]
    fn final_flag_inside_init_payload_is_honored() {
        let topology = build(
            r#"{
                "spouts": [ { "name": "in", "type": "generator" } ],
                "bolts": [
                    {
                        "name": "audit", "type": "log",
                        "init": { "final": true },
                        "inputs": [ { "source": "in" } ]
                    }
                ]
            }"#,
        )
        .unwrap();
        assert!(topology.nodes[1].terminal);
    }

    #[test]
    fn effective_final_injected_into_init() {
        let topology = build(
            r#"{
                "spouts": [ { "name": "in", "type": "generator" } ],
                "bolts": [
                    {
                        "name": "audit", "type": "log", "final": true,
                        "inputs": [ { "source": "in" } ]
                    }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            topology.nodes[1].init.get("final"),
            Some(&Value::Bool(true))
        );
    }
}
