//! Collaborator seams: models, datasets and losses.
//!
//! The core never differentiates anything itself. Forward/backward is a capability
//! a `Model` implementation provides; the estimator and trainer only read the
//! gradients it populates.

use ndarray::{Array2, ArrayD, Axis};

use crate::error::{FlError, Result};
use crate::params::ParameterSet;

/// One mini-batch: row-major inputs and one class label per row.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn new(inputs: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        if inputs.nrows() != labels.len() {
            return Err(FlError::Data(format!("{} input rows but {} labels", inputs.nrows(), labels.len())));
        }
        Ok(Self { inputs, labels })
    }

    pub fn len(&self) -> usize { self.labels.len() }

    pub fn is_empty(&self) -> bool { self.labels.is_empty() }
}

/// Finite, re-iterable sequence of batches.
pub trait Dataset: Send + Sync {
    fn batches(&self) -> Box<dyn Iterator<Item = &Batch> + '_>;
    fn num_batches(&self) -> usize;
    fn num_samples(&self) -> usize;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    batches: Vec<Batch>,
}

impl InMemoryDataset {
    pub fn from_batches(batches: Vec<Batch>) -> Self { Self { batches } }

    /// Chunks `inputs` row-wise into batches of `batch_size` (the last one may be short).
    pub fn from_samples(inputs: Array2<f32>, labels: Vec<usize>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(FlError::InvalidConfig("batch_size must be > 0".into()));
        }
        if inputs.nrows() != labels.len() {
            return Err(FlError::Data(format!("{} input rows but {} labels", inputs.nrows(), labels.len())));
        }
        let batches = inputs
            .axis_chunks_iter(Axis(0), batch_size)
            .zip(labels.chunks(batch_size))
            .map(|(x, y)| Batch { inputs: x.to_owned(), labels: y.to_vec() })
            .collect();
        Ok(Self { batches })
    }
}

impl Dataset for InMemoryDataset {
    fn batches(&self) -> Box<dyn Iterator<Item = &Batch> + '_> { Box::new(self.batches.iter()) }
    fn num_batches(&self) -> usize { self.batches.len() }
    fn num_samples(&self) -> usize { self.batches.iter().map(Batch::len).sum() }
}

pub trait Loss: Send + Sync {
    /// Mean loss over the batch and its gradient w.r.t. `logits`.
    fn loss_and_grad(&self, logits: &Array2<f32>, labels: &[usize]) -> Result<(f32, Array2<f32>)>;
}

/// Softmax cross-entropy, mean-reduced over the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl Loss for CrossEntropyLoss {
    fn loss_and_grad(&self, logits: &Array2<f32>, labels: &[usize]) -> Result<(f32, Array2<f32>)> {
        let (rows, classes) = logits.dim();
        if rows != labels.len() {
            return Err(FlError::Data(format!("{rows} logit rows but {} labels", labels.len())));
        }
        if rows == 0 {
            return Err(FlError::Data("empty batch".into()));
        }
        let mut grad = Array2::<f32>::zeros((rows, classes));
        let mut total = 0.0f64;
        for (i, (row, &label)) in logits.outer_iter().zip(labels).enumerate() {
            if label >= classes {
                return Err(FlError::Data(format!("label {label} out of range for {classes} classes")));
            }
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let exp: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
            let sum: f32 = exp.iter().sum();
            total += (sum.ln() - (row[label] - max)) as f64;
            for (j, e) in exp.iter().enumerate() {
                let p = e / sum;
                grad[[i, j]] = (p - if j == label { 1.0 } else { 0.0 }) / rows as f32;
            }
        }
        Ok(((total / rows as f64) as f32, grad))
    }
}

/// Differentiable model with a named-parameter interface.
///
/// `parameters()` exposes every named tensor, trainable or not. Gradients follow
/// set-to-none semantics: after `zero_grad`, `gradient(name)` is `None` until a
/// backward pass reaches that parameter.
pub trait Model: Send + Sync {
    fn parameters(&self) -> &ParameterSet;
    fn parameters_mut(&mut self) -> &mut ParameterSet;
    fn is_trainable(&self, name: &str) -> bool;
    fn forward(&self, inputs: &Array2<f32>) -> Result<Array2<f32>>;
    fn zero_grad(&mut self);
    /// Forward, loss and backward for one batch; gradients accumulate until `zero_grad`.
    fn backward(&mut self, batch: &Batch, loss: &dyn Loss) -> Result<f32>;
    fn gradient(&self, name: &str) -> Option<&ArrayD<f32>>;

    fn trainable_names(&self) -> Vec<String> {
        self.parameters().names().into_iter().filter(|n| self.is_trainable(n)).collect()
    }

    fn export(&self) -> ParameterSet { self.parameters().clone() }

    fn load(&mut self, params: &ParameterSet) -> Result<()> {
        self.parameters().check_aligned(params)?;
        let own = self.parameters_mut();
        for (name, tensor) in params {
            if let Some(dst) = own.get_mut(name) {
                dst.assign(tensor);
            }
        }
        Ok(())
    }
}
