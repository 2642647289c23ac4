use std::error::Error;

use penstock_core::NodeRegistry;
use penstock_core::Topology;
use penstock_core::config::load_topology;
use penstock_core::transport::inmem::InMemoryBroker;
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

fn file_stem(path: &str) -> String {
    std::path::Path::new(path)
        .file_stem()
        .map_or_else(|| "topology".to_string(), |s| s.to_string_lossy().into_owned())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let Some((command, sub_matches)) = matches.subcommand() else {
        // subcommand_required(true) makes clap bail out before this
        return Ok(());
    };
    let path = sub_matches
        .get_one::<String>("topology-path")
        .expect("topology-path is a required argument");

    let definition =
        load_topology(path).map_err(|e| format!("Error loading topology: {e:?}"))?;
    let registry = NodeRegistry::with_broker(InMemoryBroker::new());

    match command {
        "validate" => {
            let topology = Topology::build(&definition, &registry)
                .map_err(|e| format!("Invalid topology: {e:?}"))?;
            info!(
                nodes = topology.node_count(),
                order = ?topology.node_names(),
                "topology is valid"
            );
        }
        "run" => {
            let name = sub_matches
                .get_one::<String>("topology-name")
                .cloned()
                .unwrap_or_else(|| file_stem(path));
            info!(topology = %name, "Starting topology");
            penstock_core::run_topology(&definition, &registry)
                .await
                .map_err(|e| format!("Error running topology: {e:?}"))?;
        }
        _ => {}
    }

    Ok(())
}
