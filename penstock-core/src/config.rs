//! Loading of the declarative topology definition. The definition is read
//! once at process start; there is no hot-reload.

use std::path::Path;

use crate::Result;
use crate::error::Error;

pub mod topology;

pub use topology::{
    BoltSpec, GeneralSpec, InputSpec, SpoutSpec, TopologyDefinition, WatermarkSpec,
};

/// Default heartbeat interval when `general.heartbeat` is absent.
pub const DEFAULT_HEARTBEAT_MS: u64 = 2000;

/// Read and parse a topology definition from a JSON file, with topology
/// variables already substituted into the node init payloads.
pub fn load_topology(path: impl AsRef<Path>) -> Result<TopologyDefinition> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading topology file {}: {e:?}", path.display())))?;
    TopologyDefinition::from_json(&raw)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"{
                "general": { "heartbeat": 500 },
                "spouts": [ { "name": "in", "type": "generator" } ],
                "bolts": [
                    {
                        "name": "out",
                        "type": "log",
                        "final": true,
                        "inputs": [ { "source": "in" } ]
                    }
                ]
            }"#,
        )
        .unwrap();

        let definition = load_topology(file.path()).unwrap();
        assert_eq!(definition.general.heartbeat, 500);
        assert_eq!(definition.spouts.len(), 1);
        assert_eq!(definition.bolts.len(), 1);
        assert!(definition.bolts[0].terminal);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = load_topology("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }
}
