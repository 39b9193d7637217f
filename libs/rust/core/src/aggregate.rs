//! Sample-weighted federated averaging.

use std::cmp::Ordering;

use ndarray::ArrayD;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{FlError, Result};
use crate::params::ParameterSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdate {
    pub client_id: usize,
    pub params: ParameterSet,
    pub num_samples: u64,
}

impl ClientUpdate {
    pub fn new(client_id: usize, params: ParameterSet, num_samples: u64) -> Self { Self { client_id, params, num_samples } }
}

/// `avg[name] = sum_i(n_i * w_i[name]) / sum_i(n_i)`.
///
/// Accumulates in f64 over a canonical ordering of the updates, so any permutation of
/// `updates` produces a bitwise-identical result. Key sets must match exactly; they are
/// never intersected.
pub fn fedavg(updates: &[ClientUpdate]) -> Result<ParameterSet> {
    let Some(first) = updates.first() else {
        return Err(FlError::EmptyUpdateSet);
    };
    for u in updates {
        validate(u)?;
        first.params.check_aligned(&u.params)?;
    }

    let mut ordered: Vec<&ClientUpdate> = updates.iter().collect();
    ordered.sort_by(|a, b| canonical_order(a, b));

    let total: f64 = ordered.iter().map(|u| u.num_samples as f64).sum();
    let layout: Vec<(&String, &ArrayD<f32>)> = first.params.iter().collect();
    let averaged: Vec<(String, ArrayD<f32>)> = layout
        .into_par_iter()
        .map(|(name, template)| {
            let mut acc = ArrayD::<f64>::zeros(template.raw_dim());
            for u in &ordered {
                if let Some(tensor) = u.params.get(name) {
                    let weight = u.num_samples as f64;
                    acc.zip_mut_with(tensor, |a, &v| *a += weight * v as f64);
                }
            }
            (name.clone(), acc.mapv(|v| (v / total) as f32))
        })
        .collect();
    Ok(averaged.into_iter().collect())
}

fn validate(update: &ClientUpdate) -> Result<()> {
    if update.num_samples == 0 {
        return Err(FlError::InvalidUpdate(format!("client {} reported zero samples", update.client_id)));
    }
    if update.params.is_empty() {
        return Err(FlError::InvalidUpdate(format!("client {} sent no parameters", update.client_id)));
    }
    for (name, tensor) in update.params.iter() {
        if tensor.iter().any(|v| !v.is_finite()) {
            return Err(FlError::InvalidUpdate(format!("client {} sent non-finite values for `{name}`", update.client_id)));
        }
    }
    Ok(())
}

fn canonical_order(a: &ClientUpdate, b: &ClientUpdate) -> Ordering {
    a.client_id
        .cmp(&b.client_id)
        .then(a.num_samples.cmp(&b.num_samples))
        .then_with(|| {
            let lhs = a.params.iter().flat_map(|(_, t)| t.iter());
            let rhs = b.params.iter().flat_map(|(_, t)| t.iter());
            lhs.zip(rhs).map(|(x, y)| x.total_cmp(y)).find(|o| o.is_ne()).unwrap_or(Ordering::Equal)
        })
}
