use clap::{Arg, Command};

pub(super) fn root_cli() -> Command {
    Command::new("penstock")
        .author("Penstock Authors")
        .about("Penstock runs document enrichment topologies")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_run_subcommand())
        .subcommand(add_validate_subcommand())
}

fn topology_path_arg() -> Arg {
    Arg::new("topology-path")
        .long("topology-path")
        .value_name("PATH")
        .help("Path of the topology definition JSON file")
        .required(true)
}

fn add_run_subcommand() -> Command {
    Command::new("run")
        .about("Run a topology until SIGINT/SIGTERM")
        .arg(topology_path_arg())
        .arg(
            Arg::new("topology-name")
                .long("topology-name")
                .value_name("NAME")
                .help("Topology name used in logs; defaults to the definition file stem"),
        )
}

fn add_validate_subcommand() -> Command {
    Command::new("validate")
        .about("Build and validate a topology definition, then exit")
        .arg(topology_path_arg())
}
