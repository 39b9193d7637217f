//! Named parameter tensors.
//!
//! A `ParameterSet` is ordered by name so every reduction over it (aggregation,
//! masking, checksumming) visits tensors in the same order on every node.

use std::collections::btree_map::{self, BTreeMap};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{FlError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ParameterSet {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> { self.tensors.get(name) }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> { self.tensors.get_mut(name) }

    pub fn contains(&self, name: &str) -> bool { self.tensors.contains_key(name) }

    pub fn len(&self) -> usize { self.tensors.len() }

    pub fn is_empty(&self) -> bool { self.tensors.is_empty() }

    pub fn names(&self) -> Vec<String> { self.tensors.keys().cloned().collect() }

    /// Total number of scalar entries across all tensors.
    pub fn numel(&self) -> usize { self.tensors.values().map(|t| t.len()).sum() }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ArrayD<f32>> { self.tensors.iter() }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, String, ArrayD<f32>> { self.tensors.iter_mut() }

    pub fn same_keys(&self, other: &ParameterSet) -> bool {
        self.tensors.len() == other.tensors.len() && self.tensors.keys().zip(other.tensors.keys()).all(|(a, b)| a == b)
    }

    /// Name-aligned comparison: identical key sets and identical shapes per key.
    pub fn check_aligned(&self, other: &ParameterSet) -> Result<()> {
        if !self.same_keys(other) {
            return Err(FlError::MisalignedKeys { expected: self.names(), found: other.names() });
        }
        for (name, tensor) in &self.tensors {
            let theirs = &other.tensors[name];
            if tensor.shape() != theirs.shape() {
                return Err(FlError::ShapeMismatch {
                    name: name.clone(),
                    expected: tensor.shape().to_vec(),
                    actual: theirs.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    pub fn zeros_like(&self) -> ParameterSet {
        self.tensors.iter().map(|(n, t)| (n.clone(), ArrayD::zeros(t.raw_dim()))).collect()
    }
}

impl FromIterator<(String, ArrayD<f32>)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self { tensors: iter.into_iter().collect() }
    }
}

impl IntoIterator for ParameterSet {
    type Item = (String, ArrayD<f32>);
    type IntoIter = btree_map::IntoIter<String, ArrayD<f32>>;
    fn into_iter(self) -> Self::IntoIter { self.tensors.into_iter() }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = (&'a String, &'a ArrayD<f32>);
    type IntoIter = btree_map::Iter<'a, String, ArrayD<f32>>;
    fn into_iter(self) -> Self::IntoIter { self.tensors.iter() }
}
