//! Two-layer perceptron classifier with hand-written backprop.
//!
//! Reference implementation of [`Model`] used by the simulated runner and the tests.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, Ix2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{FlError, Result};
use crate::model::{Batch, Loss, Model};
use crate::params::ParameterSet;

pub const FC1_WEIGHT: &str = "fc1.weight";
pub const FC1_BIAS: &str = "fc1.bias";
pub const FC2_WEIGHT: &str = "fc2.weight";
pub const FC2_BIAS: &str = "fc2.bias";

#[derive(Debug, Clone)]
pub struct MlpClassifier {
    params: ParameterSet,
    grads: BTreeMap<String, ArrayD<f32>>,
    frozen: BTreeSet<String>,
    input_dim: usize,
}

struct Activations {
    pre: Array2<f32>,
    hidden: Array2<f32>,
    logits: Array2<f32>,
}

impl MlpClassifier {
    /// Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in)) weights, zero biases.
    pub fn new(input_dim: usize, hidden: usize, classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uniform = |rows: usize, cols: usize| {
            let bound = 1.0 / (rows as f32).sqrt();
            Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..=bound)).into_dyn()
        };
        let mut params = ParameterSet::new();
        params.insert(FC1_WEIGHT, uniform(input_dim, hidden));
        params.insert(FC1_BIAS, Array1::<f32>::zeros(hidden).into_dyn());
        params.insert(FC2_WEIGHT, uniform(hidden, classes));
        params.insert(FC2_BIAS, Array1::<f32>::zeros(classes).into_dyn());
        Self { params, grads: BTreeMap::new(), frozen: BTreeSet::new(), input_dim }
    }

    /// Marks a parameter non-trainable: no gradient, no update, not scored or masked.
    pub fn freeze(&mut self, name: &str) -> Result<()> {
        if !self.params.contains(name) {
            return Err(FlError::Model(format!("unknown parameter `{name}`")));
        }
        self.frozen.insert(name.to_string());
        self.grads.remove(name);
        Ok(())
    }

    fn matrix(&self, name: &str) -> Result<ArrayView2<'_, f32>> {
        self.tensor(name)?
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| FlError::Model(format!("`{name}` is not a matrix: {e}")))
    }

    fn vector(&self, name: &str) -> Result<ArrayView1<'_, f32>> {
        self.tensor(name)?
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| FlError::Model(format!("`{name}` is not a vector: {e}")))
    }

    fn tensor(&self, name: &str) -> Result<&ArrayD<f32>> {
        self.params.get(name).ok_or_else(|| FlError::Model(format!("missing parameter `{name}`")))
    }

    fn activations(&self, inputs: &Array2<f32>) -> Result<Activations> {
        if inputs.ncols() != self.input_dim {
            return Err(FlError::Data(format!("expected {} input features, got {}", self.input_dim, inputs.ncols())));
        }
        let pre = inputs.dot(&self.matrix(FC1_WEIGHT)?) + &self.vector(FC1_BIAS)?;
        let hidden = pre.mapv(|v| v.max(0.0));
        let logits = hidden.dot(&self.matrix(FC2_WEIGHT)?) + &self.vector(FC2_BIAS)?;
        Ok(Activations { pre, hidden, logits })
    }

    fn accumulate(&mut self, name: &str, grad: ArrayD<f32>) {
        if self.frozen.contains(name) {
            return;
        }
        match self.grads.get_mut(name) {
            Some(acc) => *acc += &grad,
            None => {
                self.grads.insert(name.to_string(), grad);
            }
        }
    }
}

impl Model for MlpClassifier {
    fn parameters(&self) -> &ParameterSet { &self.params }

    fn parameters_mut(&mut self) -> &mut ParameterSet { &mut self.params }

    fn is_trainable(&self, name: &str) -> bool { self.params.contains(name) && !self.frozen.contains(name) }

    fn forward(&self, inputs: &Array2<f32>) -> Result<Array2<f32>> { Ok(self.activations(inputs)?.logits) }

    fn zero_grad(&mut self) { self.grads.clear(); }

    fn backward(&mut self, batch: &Batch, loss: &dyn Loss) -> Result<f32> {
        let acts = self.activations(&batch.inputs)?;
        let (value, d_logits) = loss.loss_and_grad(&acts.logits, &batch.labels)?;

        let d_w2 = acts.hidden.t().dot(&d_logits);
        let d_b2 = d_logits.sum_axis(Axis(0));
        let mut d_hidden = d_logits.dot(&self.matrix(FC2_WEIGHT)?.t());
        d_hidden.zip_mut_with(&acts.pre, |g, &p| {
            if p <= 0.0 {
                *g = 0.0;
            }
        });
        let d_w1 = batch.inputs.t().dot(&d_hidden);
        let d_b1 = d_hidden.sum_axis(Axis(0));

        self.accumulate(FC1_WEIGHT, d_w1.into_dyn());
        self.accumulate(FC1_BIAS, d_b1.into_dyn());
        self.accumulate(FC2_WEIGHT, d_w2.into_dyn());
        self.accumulate(FC2_BIAS, d_b2.into_dyn());
        Ok(value)
    }

    fn gradient(&self, name: &str) -> Option<&ArrayD<f32>> { self.grads.get(name) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CrossEntropyLoss;
    use ndarray::array;

    fn batch() -> Batch {
        Batch::new(array![[1.0f32, -0.5, 0.25], [0.3, 0.8, -1.2]], vec![0, 1]).unwrap()
    }

    #[test]
    fn same_seed_same_weights() {
        let a = MlpClassifier::new(3, 4, 2, 11);
        let b = MlpClassifier::new(3, 4, 2, 11);
        assert_eq!(a.export(), b.export());
        assert_ne!(a.export(), MlpClassifier::new(3, 4, 2, 12).export());
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut model = MlpClassifier::new(3, 4, 2, 5);
        // keep hidden units away from the ReLU kink
        model.parameters_mut().get_mut(FC1_BIAS).unwrap().fill(0.5);
        let b = batch();
        model.zero_grad();
        model.backward(&b, &CrossEntropyLoss).unwrap();
        let analytic = model.gradient(FC2_WEIGHT).unwrap().clone();

        let eps = 1e-3f32;
        for idx in [[0usize, 0usize], [2, 1], [3, 0]] {
            let at = &idx[..];
            let mut plus = model.clone();
            plus.parameters_mut().get_mut(FC2_WEIGHT).unwrap()[at] += eps;
            let mut minus = model.clone();
            minus.parameters_mut().get_mut(FC2_WEIGHT).unwrap()[at] -= eps;
            let lp = CrossEntropyLoss.loss_and_grad(&plus.forward(&b.inputs).unwrap(), &b.labels).unwrap().0;
            let lm = CrossEntropyLoss.loss_and_grad(&minus.forward(&b.inputs).unwrap(), &b.labels).unwrap().0;
            let numeric = (lp - lm) / (2.0 * eps);
            assert!((numeric - analytic[at]).abs() < 1e-2, "{numeric} vs {}", analytic[at]);
        }
    }

    #[test]
    fn frozen_parameters_get_no_gradient() {
        let mut model = MlpClassifier::new(3, 4, 2, 5);
        model.freeze(FC1_BIAS).unwrap();
        model.backward(&batch(), &CrossEntropyLoss).unwrap();
        assert!(model.gradient(FC1_BIAS).is_none());
        assert!(model.gradient(FC1_WEIGHT).is_some());
        assert!(!model.trainable_names().contains(&FC1_BIAS.to_string()));
    }

    #[test]
    fn export_load_round_trip_is_exact() {
        let source = MlpClassifier::new(3, 4, 2, 1);
        let exported = source.export();
        let mut fresh = MlpClassifier::new(3, 4, 2, 99);
        fresh.load(&exported).unwrap();
        assert_eq!(fresh.export(), exported);
    }

    #[test]
    fn load_rejects_foreign_layout() {
        let mut model = MlpClassifier::new(3, 4, 2, 1);
        let other = MlpClassifier::new(3, 5, 2, 1).export();
        assert!(matches!(model.load(&other), Err(FlError::ShapeMismatch { .. })));
    }
}
