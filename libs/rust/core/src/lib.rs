//! Federated fine-tuning with Fisher-guided sparse masks.
//!
//! Clients score parameter sensitivity, calibrate a binary keep-mask by iterative
//! thresholding, train under that mask, and the orchestrator folds their updates into
//! the global model with sample-weighted averaging.

pub mod aggregate;
pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod eval;
pub mod fisher;
pub mod mask;
pub mod mlp;
pub mod model;
pub mod orchestrator;
pub mod params;
pub mod sampling;
pub mod sink;
pub mod telemetry;
pub mod trainer;

pub use aggregate::{fedavg, ClientUpdate};
pub use cancel::CancelToken;
pub use checkpoint::{CheckpointStore, FileCheckpointStore};
pub use crate::config::{config_builder, load_config, CheckpointConfig, FailurePolicy, FederationConfig, SparsityConfig};
pub use error::{FlError, Result};
pub use eval::{classification_metrics, Evaluator, HeldOutEvaluator};
pub use fisher::{compute_fisher_scores, FisherOptions, FisherScores, MissingGradientPolicy};
pub use mask::{calibrate_mask, keep_schedule, CalibrationConfig, GatherMode, Mask, SparsityPolicy};
pub use mlp::MlpClassifier;
pub use model::{Batch, CrossEntropyLoss, Dataset, InMemoryDataset, Loss, Model};
pub use orchestrator::{FederatedRun, GlobalState, RoundPhase, RunSummary};
pub use params::ParameterSet;
pub use sampling::select_clients;
pub use sink::{JsonLinesSink, MemorySink, RoundRecord, RoundSink, TracingSink};
pub use telemetry::{init_tracing, FlMetrics, FL_METRICS};
pub use trainer::{local_train, train_client, ClientResult, ClientTask, LocalOutcome, TrainingConfig};
