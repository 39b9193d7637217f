//! Error taxonomy shared by the estimator, calibrator, trainer, aggregator and orchestrator.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlError>;

#[derive(Debug, Error)]
pub enum FlError {
    #[error("dataset yielded no batches")]
    EmptyDataset,

    #[error("trainable parameters never received a gradient: {names:?}")]
    NoGradient { names: Vec<String> },

    #[error("infeasible sparsity for `{group}`: keep count {keep} with {numel} elements")]
    InfeasibleSparsity { group: String, keep: i64, numel: usize },

    #[error("no client updates to aggregate")]
    EmptyUpdateSet,

    #[error("parameter names misaligned: expected {expected:?}, found {found:?}")]
    MisalignedKeys { expected: Vec<String>, found: Vec<String> },

    #[error("client {client} failed: {source}")]
    ClientFailure {
        client: usize,
        #[source]
        source: Box<FlError>,
    },

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { name: String, expected: Vec<usize>, actual: Vec<usize> },

    #[error("invalid client update: {0}")]
    InvalidUpdate(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid data: {0}")]
    Data(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("training diverged: {0}")]
    Diverged(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("telemetry setup failed: {0}")]
    Telemetry(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl FlError {
    /// Misconfiguration stops the run; it is never absorbed by a client failure policy.
    pub fn is_fatal(&self) -> bool {
        match self {
            FlError::InfeasibleSparsity { .. } | FlError::InvalidConfig(_) | FlError::Config(_) => true,
            FlError::ClientFailure { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    pub fn client(client: usize, err: FlError) -> Self {
        FlError::ClientFailure { client, source: Box::new(err) }
    }
}
