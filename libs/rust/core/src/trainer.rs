//! Masked local fine-tuning.
//!
//! Momentum SGD (`v = mu * v + g`, `p -= lr * v`) over the trainable parameters, with
//! the parameters projected onto the mask before the first step and again after every
//! step. Without a mask this is plain local training.

use std::collections::btree_map::{BTreeMap, Entry};
use std::sync::Arc;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::aggregate::ClientUpdate;
use crate::cancel::CancelToken;
use crate::config::SparsityConfig;
use crate::error::{FlError, Result};
use crate::fisher::{compute_fisher_scores, FisherOptions};
use crate::mask::{calibrate_mask, Mask};
use crate::model::{Dataset, Loss, Model};
use crate::params::ParameterSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    pub momentum: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self { Self { epochs: 1, learning_rate: 0.01, momentum: 0.9 } }
}

#[derive(Debug, Clone)]
pub struct LocalOutcome {
    pub params: ParameterSet,
    /// Examples in the local dataset (one epoch's worth).
    pub num_samples: u64,
    pub mean_loss: f32,
    pub steps: usize,
}

pub fn local_train<M>(model: &mut M, data: &dyn Dataset, loss: &dyn Loss, cfg: &TrainingConfig, mask: Option<&Mask>, cancel: &CancelToken) -> Result<LocalOutcome>
where
    M: Model + ?Sized,
{
    if data.num_batches() == 0 {
        return Err(FlError::EmptyDataset);
    }
    if let Some(m) = mask {
        m.apply(model.parameters_mut())?;
    }

    let trainable = model.trainable_names();
    let mut velocity: BTreeMap<String, ArrayD<f32>> = BTreeMap::new();
    let (mut steps, mut loss_sum) = (0usize, 0.0f64);

    for _ in 0..cfg.epochs {
        for batch in data.batches() {
            cancel.check()?;
            model.zero_grad();
            let value = model.backward(batch, loss)?;
            if !value.is_finite() {
                return Err(FlError::Diverged(format!("loss {value} at step {steps}")));
            }
            momentum_step(model, &trainable, &mut velocity, cfg)?;
            if let Some(m) = mask {
                m.apply(model.parameters_mut())?;
            }
            loss_sum += value as f64;
            steps += 1;
        }
    }
    model.zero_grad();

    let params = model.export();
    if let Some((name, _)) = params.iter().find(|(_, t)| t.iter().any(|v| !v.is_finite())) {
        return Err(FlError::Diverged(format!("non-finite values in `{name}` after {steps} steps")));
    }
    Ok(LocalOutcome {
        params,
        num_samples: data.num_samples() as u64,
        mean_loss: if steps > 0 { (loss_sum / steps as f64) as f32 } else { 0.0 },
        steps,
    })
}

fn momentum_step<M>(model: &mut M, trainable: &[String], velocity: &mut BTreeMap<String, ArrayD<f32>>, cfg: &TrainingConfig) -> Result<()>
where
    M: Model + ?Sized,
{
    for name in trainable {
        let Some(grad) = model.gradient(name) else { continue };
        let buf = match velocity.entry(name.clone()) {
            Entry::Vacant(slot) => slot.insert(grad.clone()),
            Entry::Occupied(slot) => {
                let buf = slot.into_mut();
                if buf.shape() != grad.shape() {
                    return Err(FlError::ShapeMismatch { name: name.clone(), expected: buf.shape().to_vec(), actual: grad.shape().to_vec() });
                }
                buf.zip_mut_with(grad, |v, &g| *v = cfg.momentum * *v + g);
                buf
            }
        };
        let Some(param) = model.parameters_mut().get_mut(name) else { continue };
        if param.shape() != buf.shape() {
            return Err(FlError::ShapeMismatch { name: name.clone(), expected: param.shape().to_vec(), actual: buf.shape().to_vec() });
        }
        param.scaled_add(-cfg.learning_rate, buf);
    }
    Ok(())
}

/// Everything one selected client needs for a round.
pub struct ClientTask<'a> {
    pub client_id: usize,
    pub data: &'a dyn Dataset,
    pub loss: &'a dyn Loss,
    pub training: &'a TrainingConfig,
    pub sparsity: Option<&'a SparsityConfig>,
    /// Mask calibrated on an earlier round; skips scoring and calibration.
    pub cached_mask: Option<Arc<Mask>>,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone)]
pub struct ClientResult {
    pub update: ClientUpdate,
    pub mask: Option<Arc<Mask>>,
    pub mean_loss: f32,
    pub steps: usize,
}

/// Full client procedure: score and calibrate (unless a mask is cached), then train under the mask.
#[instrument(skip_all, fields(client = task.client_id))]
pub fn train_client<M>(model: &mut M, task: ClientTask<'_>) -> Result<ClientResult>
where
    M: Model + ?Sized,
{
    let mask = match (task.sparsity, task.cached_mask) {
        (None, _) => None,
        (Some(_), Some(cached)) => Some(cached),
        (Some(sp), None) => {
            let opts = FisherOptions { cancel: Some(task.cancel.clone()), ..sp.fisher_options() };
            let scores = compute_fisher_scores(model, task.data, task.loss, &opts)?;
            task.cancel.check()?;
            let mask = calibrate_mask(&scores, &sp.calibration())?;
            debug!(sparsity = mask.sparsity(), kept = mask.kept(), "client mask calibrated");
            Some(Arc::new(mask))
        }
    };
    let outcome = local_train(model, task.data, task.loss, task.training, mask.as_deref(), task.cancel)?;
    debug!(steps = outcome.steps, mean_loss = outcome.mean_loss, "local training finished");
    Ok(ClientResult {
        update: ClientUpdate::new(task.client_id, outcome.params, outcome.num_samples),
        mask,
        mean_loss: outcome.mean_loss,
        steps: outcome.steps,
    })
}
