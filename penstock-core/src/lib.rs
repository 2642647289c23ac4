//! Penstock runs declaratively-configured enrichment pipelines: spouts pull
//! documents in, bolts process them, and named streams wire the two into a
//! DAG that a single process schedules end to end.
//!
//! The pieces, bottom to top:
//! - a JSON document plus its routing stream ([message])
//! - stage contracts and the builtin stages ([nodes])
//! - queue adapters and the in-memory broker ([transport])
//! - definition parsing and variable substitution ([config])
//! - graph validation, routing and the dispatch engine ([topology])

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use crate::error::{Error, Result};
pub use crate::message::{Message, MessageId, StreamId};
pub use crate::nodes::{Bolt, Emitter, NodeRegistry, Spout};
pub use crate::topology::Topology;
pub use crate::topology::runner::TopologyRunner;

pub mod config;
pub mod error;
pub mod message;
pub mod nodes;
pub mod topology;
pub mod transport;

use crate::config::TopologyDefinition;

/// Build the topology from its definition and drive it until SIGINT or
/// SIGTERM arrives, then drain and stop. Errors surfacing here are fatal
/// (bad definition, failed init); per-message failures never reach this
/// level.
pub async fn run_topology(
    definition: &TopologyDefinition,
    registry: &NodeRegistry,
) -> Result<()> {
    let topology = Topology::build(definition, registry)?;

    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = TopologyRunner::new(topology).run(cln_token).await;
    if let Err(e) = &result {
        error!("Topology error: {e:?}");

        // abort the signal handler task since we are already on the way out
        if !shutdown_handle.is_finished() {
            shutdown_handle.abort();
        }
    }

    info!("Gracefully Exiting...");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal");
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
