//! Per-round client selection.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;

/// Number of clients drawn each round: `max(round(fraction * num_clients), 1)`, capped at `num_clients`.
pub fn clients_per_round(num_clients: usize, fraction: f64) -> usize {
    let drawn = (fraction * num_clients as f64).round() as usize;
    drawn.max(1).min(num_clients)
}

/// Draws distinct client indices uniformly without replacement.
///
/// The generator is seeded from `(seed, round)` alone, so a round's selection does not
/// depend on how many rounds ran before it in this process (resume-safe). Indices are
/// returned sorted.
pub fn select_clients(num_clients: usize, fraction: f64, seed: u64, round: u64) -> Vec<usize> {
    if num_clients == 0 {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(round_seed(seed, round));
    let mut picked = index::sample(&mut rng, num_clients, clients_per_round(num_clients, fraction)).into_vec();
    picked.sort_unstable();
    picked
}

// splitmix64 finalizer over the pair
fn round_seed(seed: u64, round: u64) -> u64 {
    let mut z = seed ^ round.wrapping_add(1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
