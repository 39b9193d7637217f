//! Diagonal Fisher-information estimate: batch-mean of squared gradients.
//!
//! Read-only pass. The model's parameters are never stepped; only its gradient
//! buffers are touched.

use std::collections::btree_map::{self, BTreeMap};

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{FlError, Result};
use crate::model::{Dataset, Loss, Model};

/// What to do with a trainable parameter that no batch produced a gradient for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingGradientPolicy {
    /// Keep its all-zero score so calibration treats it as prunable.
    #[default]
    ZeroScore,
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct FisherOptions {
    /// Score only the first N batches (dedicated calibration subset).
    pub max_batches: Option<usize>,
    pub missing_gradient: MissingGradientPolicy,
    /// Checked before every batch.
    pub cancel: Option<CancelToken>,
}

/// Per-parameter non-negative sensitivity scores, same shapes as the parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FisherScores {
    scores: BTreeMap<String, ArrayD<f32>>,
}

impl FisherScores {
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> { self.scores.get(name) }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ArrayD<f32>> { self.scores.iter() }

    pub fn names(&self) -> Vec<String> { self.scores.keys().cloned().collect() }

    pub fn len(&self) -> usize { self.scores.len() }

    pub fn is_empty(&self) -> bool { self.scores.is_empty() }

    pub fn numel(&self) -> usize { self.scores.values().map(|s| s.len()).sum() }

    /// Sum of all scores of one group, accumulated in f64.
    pub fn mass(&self, name: &str) -> f64 {
        self.scores.get(name).map(|s| s.iter().map(|&v| v as f64).sum()).unwrap_or(0.0)
    }

    pub fn total_mass(&self) -> f64 { self.scores.keys().map(|n| self.mass(n)).sum() }
}

impl FromIterator<(String, ArrayD<f32>)> for FisherScores {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self { scores: iter.into_iter().collect() }
    }
}

pub fn compute_fisher_scores<M>(model: &mut M, data: &dyn Dataset, loss: &dyn Loss, opts: &FisherOptions) -> Result<FisherScores>
where
    M: Model + ?Sized,
{
    let trainable = model.trainable_names();
    let mut scores: BTreeMap<String, ArrayD<f32>> = trainable
        .iter()
        .filter_map(|name| model.parameters().get(name).map(|p| (name.clone(), ArrayD::zeros(p.raw_dim()))))
        .collect();
    let mut seen: BTreeMap<&str, bool> = trainable.iter().map(|n| (n.as_str(), false)).collect();

    let limit = opts.max_batches.unwrap_or(usize::MAX);
    let mut batches = 0usize;
    for batch in data.batches().take(limit) {
        if let Some(token) = &opts.cancel {
            token.check()?;
        }
        model.zero_grad();
        model.backward(batch, loss)?;
        for name in &trainable {
            let (Some(grad), Some(acc)) = (model.gradient(name), scores.get_mut(name)) else { continue };
            if grad.shape() != acc.shape() {
                return Err(FlError::ShapeMismatch { name: name.clone(), expected: acc.shape().to_vec(), actual: grad.shape().to_vec() });
            }
            Zip::from(acc).and(grad).for_each(|s, &g| *s += g * g);
            if let Some(flag) = seen.get_mut(name.as_str()) {
                *flag = true;
            }
        }
        batches += 1;
    }
    model.zero_grad();

    if batches == 0 {
        return Err(FlError::EmptyDataset);
    }

    let missing: Vec<String> = seen.iter().filter(|(_, hit)| !**hit).map(|(n, _)| n.to_string()).collect();
    if !missing.is_empty() {
        match opts.missing_gradient {
            MissingGradientPolicy::Fail => return Err(FlError::NoGradient { names: missing }),
            MissingGradientPolicy::ZeroScore => warn!(params = ?missing, "no gradient reached these parameters; scoring them zero"),
        }
    }

    let denom = batches as f32;
    for (name, score) in scores.iter_mut() {
        if score.iter().any(|v| !v.is_finite()) {
            return Err(FlError::Diverged(format!("non-finite fisher score for `{name}`")));
        }
        score.mapv_inplace(|v| v / denom);
    }
    debug!(batches, groups = scores.len(), "fisher scores computed");
    Ok(FisherScores { scores })
}
