//! Fisher-guided binary masks with iterative thresholding.
//!
//! Each calibration round re-selects the top `keep` scores from the population that
//! survived the previous round (all parameters on the first round) and rebuilds the
//! mask as `score >= threshold` over every parameter. Scores equal to the threshold
//! are all kept, so ties may push the realized keep count above the target.
//!
//! Scores are compared in IEEE total order everywhere, so both gather modes and the
//! final comparison agree on every input, including signed zeros.

use std::cmp::Ordering;
use std::collections::btree_map::{self, BTreeMap};

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{FlError, Result};
use crate::fisher::FisherScores;
use crate::params::ParameterSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparsityPolicy {
    /// One target across the concatenation of all groups.
    #[default]
    Global,
    /// Per-group targets scaled by each group's share of the Fisher mass.
    LayerWise,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherMode {
    /// Copy the surviving scores out and select on the copy.
    #[default]
    Materialize,
    /// Bisect over the score key space, rescanning the survivors in place.
    Recompute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    pub target_sparsity: f64,
    pub rounds: usize,
    pub policy: SparsityPolicy,
    pub dynamic: bool,
    pub gather: GatherMode,
}

impl CalibrationConfig {
    pub fn global(target_sparsity: f64, rounds: usize) -> Self {
        Self { target_sparsity, rounds, policy: SparsityPolicy::Global, dynamic: false, gather: GatherMode::Materialize }
    }
}

/// Binary keep-pattern; every entry is exactly 0.0 or 1.0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mask {
    masks: BTreeMap<String, ArrayD<f32>>,
}

impl Mask {
    /// Keeps everything; used as the starting population.
    pub fn all_ones_like(scores: &FisherScores) -> Self {
        Self { masks: scores.iter().map(|(n, s)| (n.clone(), ArrayD::ones(s.raw_dim()))).collect() }
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> { self.masks.get(name) }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ArrayD<f32>> { self.masks.iter() }

    pub fn names(&self) -> Vec<String> { self.masks.keys().cloned().collect() }

    pub fn numel(&self) -> usize { self.masks.values().map(|m| m.len()).sum() }

    pub fn kept(&self) -> usize { self.masks.values().map(count_kept).sum() }

    /// Fraction of zero entries over the whole mask.
    pub fn sparsity(&self) -> f64 {
        let numel = self.numel();
        if numel == 0 {
            return 0.0;
        }
        1.0 - self.kept() as f64 / numel as f64
    }

    pub fn layer_sparsity(&self) -> BTreeMap<String, f64> {
        self.masks
            .iter()
            .map(|(n, m)| {
                let s = if m.is_empty() { 0.0 } else { 1.0 - count_kept(m) as f64 / m.len() as f64 };
                (n.clone(), s)
            })
            .collect()
    }

    pub fn is_binary(&self) -> bool { self.masks.values().all(|m| m.iter().all(|&v| v == 0.0 || v == 1.0)) }

    /// Projects `params` onto the mask support. Parameters the mask does not cover are left as they are.
    pub fn apply(&self, params: &mut ParameterSet) -> Result<()> {
        for (name, mask) in &self.masks {
            let Some(param) = params.get_mut(name) else {
                return Err(FlError::MisalignedKeys { expected: self.names(), found: params.names() });
            };
            if param.shape() != mask.shape() {
                return Err(FlError::ShapeMismatch { name: name.clone(), expected: mask.shape().to_vec(), actual: param.shape().to_vec() });
            }
            Zip::from(param).and(mask).for_each(|p, &m| *p *= m);
        }
        Ok(())
    }
}

fn count_kept(m: &ArrayD<f32>) -> usize { m.iter().filter(|&&v| v > 0.0).count() }

pub fn calibrate_mask(scores: &FisherScores, cfg: &CalibrationConfig) -> Result<Mask> {
    if cfg.rounds == 0 {
        return Err(FlError::InvalidConfig("calibration rounds must be >= 1".into()));
    }
    let s = cfg.target_sparsity;
    if !s.is_finite() || !(0.0..1.0).contains(&s) {
        let numel = scores.numel();
        return Err(FlError::InfeasibleSparsity { group: "*".into(), keep: nominal_keep(numel, s), numel });
    }

    let mut mask = Mask::all_ones_like(scores);
    match cfg.policy {
        SparsityPolicy::Global => {
            let schedule = keep_schedule(keep_count("*", scores.numel(), s)?, s, cfg.rounds, cfg.dynamic);
            for (round, &keep) in schedule.iter().enumerate() {
                let threshold = kth_largest(|| surviving(scores, &mask), keep, cfg.gather);
                mask = Mask { masks: scores.iter().map(|(n, sc)| (n.clone(), threshold_mask(sc, threshold))).collect() };
                log_round(round, cfg.rounds, &mask);
            }
        }
        SparsityPolicy::LayerWise => {
            let mut schedules = BTreeMap::new();
            for (name, target) in layer_sparsity_targets(scores, s) {
                let numel = scores.get(&name).map(|t| t.len()).unwrap_or(0);
                schedules.insert(name.clone(), keep_schedule(keep_count(&name, numel, target)?, s, cfg.rounds, cfg.dynamic));
            }
            for round in 0..cfg.rounds {
                let mut next = BTreeMap::new();
                for (name, sc) in scores.iter() {
                    let keep = schedules[name][round];
                    let current = &mask.masks[name];
                    let threshold = kth_largest(|| group_survivors(sc, current), keep, cfg.gather);
                    next.insert(name.clone(), threshold_mask(sc, threshold));
                }
                mask = Mask { masks: next };
                log_round(round, cfg.rounds, &mask);
            }
        }
    }
    Ok(mask)
}

/// Per-group sparsity `(1 - mass_g / mass_total) * target`; uniform `target` when the total mass is zero.
pub fn layer_sparsity_targets(scores: &FisherScores, target: f64) -> BTreeMap<String, f64> {
    let total = scores.total_mass();
    scores
        .names()
        .into_iter()
        .map(|name| {
            let share = if total > 0.0 { scores.mass(&name) / total } else { 0.0 };
            let sparsity = (1.0 - share) * target;
            (name, sparsity)
        })
        .collect()
}

/// `round(numel * (1 - sparsity))`, rejected when it falls outside `[0, numel]`.
pub fn keep_count(group: &str, numel: usize, sparsity: f64) -> Result<usize> {
    let keep = nominal_keep(numel, sparsity);
    if keep < 0 || keep as usize > numel || !sparsity.is_finite() {
        return Err(FlError::InfeasibleSparsity { group: group.to_string(), keep, numel });
    }
    Ok(keep as usize)
}

fn nominal_keep(numel: usize, sparsity: f64) -> i64 { (numel as f64 * (1.0 - sparsity)).round() as i64 }

/// Keep target used by each calibration round. In dynamic mode the target shrinks by
/// `1 - target_sparsity / rounds` after every round but the last.
pub fn keep_schedule(initial: usize, target_sparsity: f64, rounds: usize, dynamic: bool) -> Vec<usize> {
    let factor = 1.0 - target_sparsity / rounds.max(1) as f64;
    let mut keep = initial;
    let mut schedule = Vec::with_capacity(rounds);
    for round in 0..rounds {
        schedule.push(keep);
        if dynamic && round + 1 < rounds {
            keep = (keep as f64 * factor).round() as usize;
        }
    }
    schedule
}

fn surviving<'a>(scores: &'a FisherScores, mask: &'a Mask) -> impl Iterator<Item = f32> + 'a {
    scores.iter().flat_map(move |(name, sc)| {
        let m = &mask.masks[name];
        sc.iter().zip(m.iter()).filter(|(_, keep)| **keep > 0.0).map(|(&v, _)| v)
    })
}

fn group_survivors<'a>(scores: &'a ArrayD<f32>, mask: &'a ArrayD<f32>) -> impl Iterator<Item = f32> + 'a {
    scores.iter().zip(mask.iter()).filter(|(_, keep)| **keep > 0.0).map(|(&v, _)| v)
}

/// `None` means unreachable: nothing is kept.
fn threshold_mask(scores: &ArrayD<f32>, threshold: Option<f32>) -> ArrayD<f32> {
    match threshold {
        None => ArrayD::zeros(scores.raw_dim()),
        Some(t) => scores.mapv(|v| if v.total_cmp(&t) != Ordering::Less { 1.0 } else { 0.0 }),
    }
}

/// The `k`-th largest value of `population` (clamped to its size), or `None` when
/// `k == 0` or the population is empty.
fn kth_largest<I, F>(population: F, k: usize, mode: GatherMode) -> Option<f32>
where
    F: Fn() -> I,
    I: Iterator<Item = f32>,
{
    if k == 0 {
        return None;
    }
    match mode {
        GatherMode::Materialize => {
            let mut values: Vec<f32> = population().collect();
            if values.is_empty() {
                return None;
            }
            let idx = k.min(values.len()) - 1;
            let (_, kth, _) = values.select_nth_unstable_by(idx, |a, b| b.total_cmp(a));
            Some(*kth)
        }
        GatherMode::Recompute => {
            let n = population().count();
            if n == 0 {
                return None;
            }
            // k-th largest == r-th smallest
            let rank = n - k.min(n) + 1;
            let (mut lo, mut hi) = (0u32, u32::MAX);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let at_or_below = population().filter(|&v| order_key(v) <= mid).count();
                if at_or_below >= rank {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            Some(from_order_key(lo))
        }
    }
}

/// Monotone map from `f32` total order onto `u32`.
fn order_key(v: f32) -> u32 {
    let bits = v.to_bits();
    if bits & 0x8000_0000 != 0 { !bits } else { bits | 0x8000_0000 }
}

fn from_order_key(key: u32) -> f32 {
    let bits = if key & 0x8000_0000 != 0 { key & 0x7fff_ffff } else { !key };
    f32::from_bits(bits)
}

fn log_round(round: usize, rounds: usize, mask: &Mask) {
    debug!(round = round + 1, rounds, sparsity = mask.sparsity(), kept = mask.kept(), "calibration round");
    trace!(layers = ?mask.layer_sparsity(), "calibration layer sparsity");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, ArrayD};

    fn scores(groups: &[(&str, &[f32])]) -> FisherScores {
        groups.iter().map(|(n, v)| (n.to_string(), arr1(v).into_dyn())).collect()
    }

    fn flat(mask: &Mask, name: &str) -> Vec<f32> { mask.get(name).unwrap().iter().copied().collect() }

    #[test]
    fn four_element_global_scenario() {
        let s = scores(&[("w", &[4.0, 1.0, 9.0, 1.0])]);
        for gather in [GatherMode::Materialize, GatherMode::Recompute] {
            let cfg = CalibrationConfig { gather, ..CalibrationConfig::global(0.5, 1) };
            let mask = calibrate_mask(&s, &cfg).unwrap();
            assert_eq!(flat(&mask, "w"), vec![1.0, 0.0, 1.0, 0.0]);
        }
    }

    #[test]
    fn ties_at_threshold_are_kept() {
        let s = scores(&[("w", &[2.0, 2.0, 2.0, 1.0])]);
        let mask = calibrate_mask(&s, &CalibrationConfig::global(0.75, 1)).unwrap();
        // keep target is 1 but all three tied scores survive
        assert_eq!(mask.kept(), 3);
    }

    #[test]
    fn realized_sparsity_tracks_target_and_is_monotone() {
        let values: Vec<f32> = (0..200).map(|i| ((i * 37) % 200) as f32 + 0.5).collect();
        let s = scores(&[("a", &values[..120]), ("b", &values[120..])]);
        let mut previous = -1.0;
        for step in 0..10 {
            let target = step as f64 / 10.0;
            let mask = calibrate_mask(&s, &CalibrationConfig::global(target, 1)).unwrap();
            assert!(mask.is_binary());
            assert!((mask.sparsity() - target).abs() <= 1.0 / 200.0 + 1e-12, "target {target} got {}", mask.sparsity());
            assert!(mask.sparsity() >= previous);
            previous = mask.sparsity();
        }
    }

    #[test]
    fn gather_modes_agree() {
        let values: Vec<f32> = (0..97).map(|i| ((i * 7919) % 101) as f32 / 13.0).collect();
        let s = scores(&[("x", &values[..40]), ("y", &values[40..])]);
        for policy in [SparsityPolicy::Global, SparsityPolicy::LayerWise] {
            for dynamic in [false, true] {
                let base = CalibrationConfig { target_sparsity: 0.7, rounds: 3, policy, dynamic, gather: GatherMode::Materialize };
                let recompute = CalibrationConfig { gather: GatherMode::Recompute, ..base.clone() };
                assert_eq!(calibrate_mask(&s, &base).unwrap(), calibrate_mask(&s, &recompute).unwrap());
            }
        }
    }

    #[test]
    fn dynamic_schedule_shrinks_between_rounds_only() {
        assert_eq!(keep_schedule(1000, 0.8, 4, true), vec![1000, 800, 640, 512]);
        assert_eq!(keep_schedule(1000, 0.8, 4, false), vec![1000; 4]);
        assert_eq!(keep_schedule(10, 0.5, 1, true), vec![10]);
    }

    #[test]
    fn dynamic_calibration_prunes_further_than_static() {
        let values: Vec<f32> = (1..=100).map(|i| i as f32).collect();
        let s = scores(&[("w", &values)]);
        let fixed = calibrate_mask(&s, &CalibrationConfig { rounds: 4, ..CalibrationConfig::global(0.8, 4) }).unwrap();
        let ramped = calibrate_mask(&s, &CalibrationConfig { dynamic: true, ..CalibrationConfig::global(0.8, 4) }).unwrap();
        assert_eq!(fixed.kept(), 20);
        // 20 -> 16 -> 13 -> 10
        assert_eq!(ramped.kept(), 10);
        assert_eq!(flat(&ramped, "w")[90..], [1.0; 10]);
    }

    #[test]
    fn layer_wise_prunes_low_mass_groups_harder() {
        let heavy: Vec<f32> = (0..10).map(|i| 10.0 + i as f32).collect();
        let light: Vec<f32> = (0..10).map(|i| 0.1 + i as f32 * 0.01).collect();
        let s = scores(&[("heavy", &heavy), ("light", &light)]);
        let targets = layer_sparsity_targets(&s, 0.5);
        assert!(targets["heavy"] < targets["light"]);
        assert!((targets["heavy"] + targets["light"] - 0.5).abs() < 1e-12);

        let cfg = CalibrationConfig { policy: SparsityPolicy::LayerWise, ..CalibrationConfig::global(0.5, 1) };
        let mask = calibrate_mask(&s, &cfg).unwrap();
        let layers = mask.layer_sparsity();
        assert!(layers["heavy"] < layers["light"]);
        // the kept entries of each group are its largest scores
        assert_eq!(flat(&mask, "light")[9], 1.0);
        assert_eq!(flat(&mask, "light")[0], 0.0);
    }

    #[test]
    fn zero_mass_falls_back_to_uniform_targets() {
        let s = scores(&[("a", &[0.0; 4]), ("b", &[0.0; 6])]);
        let targets = layer_sparsity_targets(&s, 0.4);
        assert_eq!(targets["a"], 0.4);
        assert_eq!(targets["b"], 0.4);
    }

    #[test]
    fn empty_group_stays_empty() {
        let s = scores(&[("w", &[3.0, 2.0]), ("empty", &[])]);
        let cfg = CalibrationConfig { policy: SparsityPolicy::LayerWise, rounds: 2, ..CalibrationConfig::global(0.5, 2) };
        let mask = calibrate_mask(&s, &cfg).unwrap();
        assert_eq!(mask.get("empty").unwrap().len(), 0);
        assert!(mask.is_binary());
    }

    #[test]
    fn infeasible_targets_are_rejected() {
        let s = scores(&[("w", &[1.0, 2.0])]);
        for bad in [1.0, 1.5, -0.5, f64::NAN] {
            let err = calibrate_mask(&s, &CalibrationConfig::global(bad, 1)).unwrap_err();
            assert!(matches!(err, FlError::InfeasibleSparsity { .. }), "{bad}: {err:?}");
        }
        assert!(matches!(keep_count("w", 4, -0.5), Err(FlError::InfeasibleSparsity { keep: 6, numel: 4, .. })));
        assert!(matches!(calibrate_mask(&s, &CalibrationConfig::global(0.5, 0)), Err(FlError::InvalidConfig(_))));
    }

    #[test]
    fn apply_projects_and_is_idempotent() {
        let s = scores(&[("w", &[4.0, 1.0, 9.0, 1.0])]);
        let mask = calibrate_mask(&s, &CalibrationConfig::global(0.5, 1)).unwrap();
        let mut params = ParameterSet::new();
        params.insert("w", arr1(&[0.1f32, 0.2, 0.3, 0.4]).into_dyn());
        params.insert("buffer", arr1(&[7.0f32]).into_dyn());
        mask.apply(&mut params).unwrap();
        assert_eq!(params.get("w").unwrap().iter().copied().collect::<Vec<_>>(), vec![0.1, 0.0, 0.3, 0.0]);
        assert_eq!(params.get("buffer").unwrap().iter().copied().collect::<Vec<_>>(), vec![7.0]);

        let once = params.clone();
        mask.apply(&mut params).unwrap();
        assert_eq!(params, once);
    }

    #[test]
    fn apply_rejects_uncovered_layout() {
        let s = scores(&[("w", &[1.0, 2.0])]);
        let mask = Mask::all_ones_like(&s);
        let mut params = ParameterSet::new();
        params.insert("w", ArrayD::zeros(vec![3]));
        assert!(matches!(mask.apply(&mut params), Err(FlError::ShapeMismatch { .. })));
        assert!(matches!(mask.apply(&mut ParameterSet::new()), Err(FlError::MisalignedKeys { .. })));
    }

    #[test]
    fn order_key_round_trips_and_orders() {
        let values = [-3.5f32, -0.0, 0.0, 1e-30, 2.0, f32::INFINITY];
        for w in values.windows(2) {
            assert!(order_key(w[0]) < order_key(w[1]));
        }
        for v in values {
            assert_eq!(from_order_key(order_key(v)).to_bits(), v.to_bits());
        }
    }
}
