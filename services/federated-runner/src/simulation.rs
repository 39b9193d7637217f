//! Synthetic federated classification data.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use talos_core::InMemoryDataset;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub samples: usize,
    pub test_samples: usize,
    pub features: usize,
    pub classes: usize,
    pub hidden: usize,
    /// Shuffled equal shards; otherwise label-skewed shards.
    pub iid: bool,
    /// Label groups per client in the non-IID split.
    pub classes_per_client: usize,
    /// Within-class standard deviation.
    pub spread: f32,
    pub rounds_log: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { samples: 4000, test_samples: 800, features: 16, classes: 4, hidden: 32, iid: true, classes_per_client: 2, spread: 1.0, rounds_log: None }
    }
}

pub struct Simulation {
    pub clients: Vec<InMemoryDataset>,
    pub test: InMemoryDataset,
}

struct Pool {
    inputs: Array2<f32>,
    labels: Vec<usize>,
}

impl Pool {
    fn subset(&self, rows: &[usize], batch_size: usize) -> Result<InMemoryDataset> {
        let inputs = self.inputs.select(Axis(0), rows);
        let labels = rows.iter().map(|&r| self.labels[r]).collect();
        Ok(InMemoryDataset::from_samples(inputs, labels, batch_size)?)
    }
}

/// Gaussian class blobs around random centres, split across `num_clients`.
pub fn generate(cfg: &SimulationConfig, num_clients: usize, batch_size: usize, seed: u64) -> Result<Simulation> {
    if cfg.classes < 2 || cfg.features == 0 {
        bail!("simulation needs at least 2 classes and 1 feature");
    }
    if !cfg.iid && !(1..=cfg.classes).contains(&cfg.classes_per_client) {
        bail!("classes_per_client must be in 1..={}, got {}", cfg.classes, cfg.classes_per_client);
    }
    if cfg.samples < num_clients {
        bail!("{} samples cannot cover {num_clients} clients", cfg.samples);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let centres = Array2::from_shape_fn((cfg.classes, cfg.features), |_| 3.0 * sample(&mut rng));
    let train = blobs(&centres, cfg.samples, cfg.spread, &mut rng);
    let test = blobs(&centres, cfg.test_samples, cfg.spread, &mut rng);

    let shards = if cfg.iid { iid_shards(cfg.samples, num_clients, &mut rng) } else { label_shards(&train.labels, cfg.classes, num_clients, cfg.classes_per_client, &mut rng) };
    let clients = shards.iter().map(|rows| train.subset(rows, batch_size)).collect::<Result<Vec<_>>>()?;
    let all: Vec<usize> = (0..cfg.test_samples).collect();
    Ok(Simulation { clients, test: test.subset(&all, batch_size)? })
}

fn sample(rng: &mut StdRng) -> f32 { StandardNormal.sample(rng) }

fn blobs(centres: &Array2<f32>, n: usize, spread: f32, rng: &mut StdRng) -> Pool {
    let classes = centres.nrows();
    let labels: Vec<usize> = (0..n).map(|i| i % classes).collect();
    let mut inputs = Array2::zeros((n, centres.ncols()));
    for (mut row, &label) in inputs.outer_iter_mut().zip(&labels) {
        let noise = Array1::from_shape_fn(centres.ncols(), |_| spread * sample(rng));
        row.assign(&(&centres.row(label) + &noise));
    }
    Pool { inputs, labels }
}

fn iid_shards(n: usize, clients: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut rows: Vec<usize> = (0..n).collect();
    rows.shuffle(rng);
    let mut shards = vec![Vec::new(); clients];
    for (i, r) in rows.into_iter().enumerate() {
        shards[i % clients].push(r);
    }
    shards
}

/// Client `c` owns classes `c, c+1, ..` (mod classes); each class is split evenly among its owners.
fn label_shards(labels: &[usize], classes: usize, clients: usize, per_client: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (row, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(row);
    }
    let mut owners: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for c in 0..clients {
        for j in 0..per_client {
            owners.entry((c + j) % classes).or_default().push(c);
        }
    }
    let mut shards = vec![Vec::new(); clients];
    for (class, mut rows) in by_class {
        let Some(owning) = owners.get(&class) else { continue };
        rows.shuffle(rng);
        for (i, r) in rows.into_iter().enumerate() {
            shards[owning[i % owning.len()]].push(r);
        }
    }
    shards
}

#[cfg(test)]
mod tests {
    use super::*;
    use talos_core::Dataset;

    #[test]
    fn iid_split_is_balanced_and_complete() {
        let cfg = SimulationConfig { samples: 103, test_samples: 20, ..Default::default() };
        let sim = generate(&cfg, 10, 8, 1).unwrap();
        let sizes: Vec<usize> = sim.clients.iter().map(|c| c.num_samples()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 103);
        assert!(sizes.iter().all(|&s| s == 10 || s == 11));
        assert_eq!(sim.test.num_samples(), 20);
    }

    #[test]
    fn non_iid_clients_see_only_their_classes() {
        let cfg = SimulationConfig { samples: 400, test_samples: 10, classes: 4, iid: false, classes_per_client: 1, ..Default::default() };
        let sim = generate(&cfg, 4, 16, 2).unwrap();
        for (c, client) in sim.clients.iter().enumerate() {
            assert!(client.batches().flat_map(|b| b.labels.iter()).all(|&l| l == c));
            assert_eq!(client.num_samples(), 100);
        }
    }

    #[test]
    fn same_seed_same_data() {
        let cfg = SimulationConfig { samples: 50, test_samples: 5, ..Default::default() };
        let a = generate(&cfg, 5, 4, 9).unwrap();
        let b = generate(&cfg, 5, 4, 9).unwrap();
        let first = |s: &Simulation| s.clients[0].batches().next().unwrap().inputs.clone();
        assert_eq!(first(&a), first(&b));
    }

    #[test]
    fn rejects_impossible_splits() {
        let skewed = SimulationConfig { iid: false, classes_per_client: 9, ..Default::default() };
        assert!(generate(&skewed, 4, 8, 0).is_err());
        assert!(generate(&SimulationConfig { samples: 3, ..Default::default() }, 4, 8, 0).is_err());
    }
}
