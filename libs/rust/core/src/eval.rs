//! Held-out evaluation of the global model.

use std::collections::BTreeMap;

use ndarray::{concatenate, Array2, ArrayView2, Axis};

use crate::error::{FlError, Result};
use crate::model::{CrossEntropyLoss, Dataset, Loss, Model};

pub trait Evaluator: Send + Sync {
    /// Metric name to scalar, computed over the whole evaluation set.
    fn evaluate(&self, model: &dyn Model) -> Result<BTreeMap<String, f64>>;
}

/// `accuracy`, `loss` (mean cross-entropy) and `num_examples` for a logit matrix.
pub fn classification_metrics(logits: &Array2<f32>, labels: &[usize]) -> Result<BTreeMap<String, f64>> {
    if logits.nrows() != labels.len() {
        return Err(FlError::Data(format!("{} predictions but {} labels", logits.nrows(), labels.len())));
    }
    if labels.is_empty() {
        return Err(FlError::EmptyDataset);
    }
    let correct = logits
        .outer_iter()
        .zip(labels)
        .filter(|(row, &label)| argmax(row.view()) == Some(label))
        .count();
    let (loss, _) = CrossEntropyLoss.loss_and_grad(logits, labels)?;
    Ok(BTreeMap::from([
        ("accuracy".to_string(), correct as f64 / labels.len() as f64),
        ("loss".to_string(), loss as f64),
        ("num_examples".to_string(), labels.len() as f64),
    ]))
}

fn argmax(row: ndarray::ArrayView1<'_, f32>) -> Option<usize> {
    row.iter().enumerate().fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
        Some((_, b)) if b >= v => best,
        _ => Some((i, v)),
    })
    .map(|(i, _)| i)
}

/// Runs the model over a held-out dataset and reduces the concatenated predictions.
pub struct HeldOutEvaluator<D> {
    data: D,
}

impl<D: Dataset> HeldOutEvaluator<D> {
    pub fn new(data: D) -> Self { Self { data } }
}

impl<D: Dataset> Evaluator for HeldOutEvaluator<D> {
    fn evaluate(&self, model: &dyn Model) -> Result<BTreeMap<String, f64>> {
        let mut outputs = Vec::with_capacity(self.data.num_batches());
        let mut labels = Vec::with_capacity(self.data.num_samples());
        for batch in self.data.batches() {
            outputs.push(model.forward(&batch.inputs)?);
            labels.extend_from_slice(&batch.labels);
        }
        if outputs.is_empty() {
            return Err(FlError::EmptyDataset);
        }
        let views: Vec<ArrayView2<'_, f32>> = outputs.iter().map(|o| o.view()).collect();
        let logits = concatenate(Axis(0), &views).map_err(|e| FlError::Model(format!("inconsistent output widths: {e}")))?;
        classification_metrics(&logits, &labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlp::MlpClassifier;
    use crate::model::InMemoryDataset;
    use ndarray::array;

    #[test]
    fn accuracy_counts_argmax_hits() {
        let logits = array![[2.0f32, 0.0], [0.0, 1.0], [3.0, -1.0], [0.5, 0.4]];
        let m = classification_metrics(&logits, &[0, 1, 1, 0]).unwrap();
        assert_eq!(m["accuracy"], 0.75);
        assert_eq!(m["num_examples"], 4.0);
        assert!(m["loss"] > 0.0);
    }

    #[test]
    fn held_out_evaluator_covers_every_batch() {
        let x = Array2::from_shape_fn((10, 3), |(i, j)| (i as f32 - j as f32) * 0.1);
        let y: Vec<usize> = (0..10).map(|i| i % 2).collect();
        let eval = HeldOutEvaluator::new(InMemoryDataset::from_samples(x, y, 4).unwrap());
        let model = MlpClassifier::new(3, 5, 2, 0);
        let m = eval.evaluate(&model).unwrap();
        assert_eq!(m["num_examples"], 10.0);
        assert!((0.0..=1.0).contains(&m["accuracy"]));
    }

    #[test]
    fn empty_evaluation_set_is_an_error() {
        let eval = HeldOutEvaluator::new(InMemoryDataset::default());
        assert!(matches!(eval.evaluate(&MlpClassifier::new(3, 5, 2, 0)), Err(FlError::EmptyDataset)));
    }
}
