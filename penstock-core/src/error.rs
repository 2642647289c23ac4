use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Topology Error - {0}")]
    Topology(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Node Init Error - node {node}: {reason}")]
    NodeInit { node: String, reason: String },

    #[error("Node Shutdown Error - node {node}: {reason}")]
    NodeShutdown { node: String, reason: String },

    #[error("Processing Error - {0}")]
    Processing(String),

    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("Node Task Terminated - {0}")]
    NodeTaskTerminated(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl Error {
    /// True for failures that must abort the whole topology rather than a
    /// single message traversal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Topology(_)
                | Error::Config(_)
                | Error::NodeInit { .. }
                | Error::NodeTaskTerminated(_)
        )
    }
}
