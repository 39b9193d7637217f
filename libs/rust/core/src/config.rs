//! Run configuration.
//!
//! Layered like the rest of the stack: struct defaults, then an optional YAML file
//! named by `TALOS_CONFIG_FILE`, then `TALOS__*` environment overrides
//! (`TALOS__SPARSITY__TARGET_SPARSITY=0.9`).

use std::path::{Path, PathBuf};

use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{FlError, Result};
use crate::fisher::{FisherOptions, MissingGradientPolicy};
use crate::mask::{CalibrationConfig, GatherMode, SparsityPolicy};
use crate::trainer::TrainingConfig;

pub const CONFIG_FILE_ENV: &str = "TALOS_CONFIG_FILE";
pub const ENV_PREFIX: &str = "TALOS";

/// What the orchestrator does when a selected client fails to produce an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Aggregate the survivors; their sample counts renormalize the weights.
    #[default]
    DropAndReweight,
    AbortRound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparsityConfig {
    pub target_sparsity: f64,
    pub calibration_rounds: usize,
    pub policy: SparsityPolicy,
    pub dynamic: bool,
    pub gather: GatherMode,
    /// Score only the first N local batches.
    pub calibration_batches: Option<usize>,
    /// Calibrate once per client and reuse the mask on later rounds.
    pub reuse_masks: bool,
    pub missing_gradient: MissingGradientPolicy,
}

impl Default for SparsityConfig {
    fn default() -> Self {
        Self {
            target_sparsity: 0.9,
            calibration_rounds: 5,
            policy: SparsityPolicy::Global,
            dynamic: false,
            gather: GatherMode::Materialize,
            calibration_batches: None,
            reuse_masks: false,
            missing_gradient: MissingGradientPolicy::ZeroScore,
        }
    }
}

impl SparsityConfig {
    pub fn calibration(&self) -> CalibrationConfig {
        CalibrationConfig {
            target_sparsity: self.target_sparsity,
            rounds: self.calibration_rounds,
            policy: self.policy,
            dynamic: self.dynamic,
            gather: self.gather,
        }
    }

    pub fn fisher_options(&self) -> FisherOptions {
        FisherOptions { max_batches: self.calibration_batches, missing_gradient: self.missing_gradient, cancel: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// No directory, no checkpoints.
    pub dir: Option<PathBuf>,
    pub every: u64,
    pub resume: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self { Self { dir: None, every: 5, resume: false } }
}

impl CheckpointConfig {
    /// Cadence plus the final round.
    pub fn is_due(&self, round: u64, final_round: u64) -> bool { self.every > 0 && (round % self.every == 0 || round == final_round) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub num_clients: usize,
    pub client_fraction: f64,
    pub rounds: u64,
    pub local_epochs: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub batch_size: usize,
    pub seed: u64,
    /// Train selected clients concurrently on the rayon pool.
    pub parallel: bool,
    /// Size of a dedicated pool; `None` uses the global one.
    pub worker_threads: Option<usize>,
    pub failure_policy: FailurePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparsity: Option<SparsityConfig>,
    pub checkpoint: CheckpointConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            num_clients: 100,
            client_fraction: 0.1,
            rounds: 20,
            local_epochs: 1,
            learning_rate: 0.01,
            momentum: 0.9,
            batch_size: 32,
            seed: 42,
            parallel: true,
            worker_threads: None,
            failure_policy: FailurePolicy::DropAndReweight,
            sparsity: None,
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl FederationConfig {
    pub fn training(&self) -> TrainingConfig {
        TrainingConfig { epochs: self.local_epochs, learning_rate: self.learning_rate, momentum: self.momentum }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FlError::InvalidConfig(msg));
        if self.num_clients == 0 {
            return invalid("num_clients must be > 0".into());
        }
        if !(self.client_fraction > 0.0 && self.client_fraction <= 1.0) {
            return invalid(format!("client_fraction must be in (0, 1], got {}", self.client_fraction));
        }
        if self.rounds == 0 {
            return invalid("rounds must be > 0".into());
        }
        if self.local_epochs == 0 {
            return invalid("local_epochs must be > 0".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be > 0".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return invalid(format!("momentum must be in [0, 1), got {}", self.momentum));
        }
        if self.worker_threads == Some(0) {
            return invalid("worker_threads must be > 0 when set".into());
        }
        if self.checkpoint.every == 0 {
            return invalid("checkpoint.every must be > 0".into());
        }
        if let Some(sp) = &self.sparsity {
            if !(0.0..1.0).contains(&sp.target_sparsity) {
                return invalid(format!("target_sparsity must be in [0, 1), got {}", sp.target_sparsity));
            }
            if sp.calibration_rounds == 0 {
                return invalid("calibration_rounds must be > 0".into());
            }
        }
        Ok(())
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(text).map_err(|e| FlError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_yaml_string(&self) -> Result<String> { serde_yaml::to_string(self).map_err(|e| FlError::InvalidConfig(e.to_string())) }
}

/// Defaults, optional file, environment. Callers may add their own defaults before building.
pub fn config_builder(file: Option<&Path>) -> Result<ConfigBuilder<DefaultState>> {
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&FederationConfig::default())?);
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml).required(false));
    }
    Ok(builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true)))
}

/// Loads and validates the layered configuration, reading the file path from `TALOS_CONFIG_FILE`.
pub fn load_config() -> Result<FederationConfig> {
    let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
    let cfg: FederationConfig = config_builder(file.as_deref())?.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        FederationConfig::default().validate().unwrap();
        let mut with_sparsity = FederationConfig::default();
        with_sparsity.sparsity = Some(SparsityConfig::default());
        with_sparsity.validate().unwrap();
    }

    #[test]
    fn validation_rejects_out_of_range_fields() {
        let base = FederationConfig::default();
        let cases: Vec<Box<dyn Fn(&mut FederationConfig)>> = vec![
            Box::new(|c| c.client_fraction = 0.0),
            Box::new(|c| c.client_fraction = 1.5),
            Box::new(|c| c.num_clients = 0),
            Box::new(|c| c.rounds = 0),
            Box::new(|c| c.batch_size = 0),
            Box::new(|c| c.learning_rate = f32::NAN),
            Box::new(|c| c.momentum = 1.0),
            Box::new(|c| c.checkpoint.every = 0),
            Box::new(|c| c.sparsity = Some(SparsityConfig { target_sparsity: 1.0, ..Default::default() })),
            Box::new(|c| c.sparsity = Some(SparsityConfig { calibration_rounds: 0, ..Default::default() })),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut cfg = base.clone();
            mutate(&mut cfg);
            assert!(matches!(cfg.validate(), Err(FlError::InvalidConfig(_))), "case {i}");
        }
    }

    #[test]
    fn yaml_round_trip_with_partial_sections() {
        let cfg = FederationConfig::from_yaml_str(
            "rounds: 3\nsparsity:\n  target_sparsity: 0.5\n  policy: layer_wise\nfailure_policy: abort_round\n",
        )
        .unwrap();
        assert_eq!(cfg.rounds, 3);
        assert_eq!(cfg.failure_policy, FailurePolicy::AbortRound);
        let sp = cfg.sparsity.clone().unwrap();
        assert_eq!(sp.policy, SparsityPolicy::LayerWise);
        assert_eq!(sp.calibration_rounds, 5);
        assert_eq!(FederationConfig::from_yaml_str(&cfg.to_yaml_string().unwrap()).unwrap(), cfg);
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("talos-config-{}.yaml", uuid::Uuid::new_v4()));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "num_clients: 7\nclient_fraction: 1.0\ncheckpoint:\n  every: 2").unwrap();
        let cfg: FederationConfig = config_builder(Some(&path)).unwrap().build().unwrap().try_deserialize().unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.num_clients, 7);
        assert_eq!(cfg.checkpoint.every, 2);
        assert_eq!(cfg.batch_size, FederationConfig::default().batch_size);
    }

    #[test]
    fn checkpoint_cadence_includes_final_round() {
        let ck = CheckpointConfig { every: 5, ..Default::default() };
        let due: Vec<u64> = (1..=12).filter(|&r| ck.is_due(r, 12)).collect();
        assert_eq!(due, vec![5, 10, 12]);
    }
}
