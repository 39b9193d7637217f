/// Calibration and aggregation benchmarks
///
/// Compares the two gather modes on a realistic score population and measures
/// FedAvg over a round's worth of client updates.
///
/// Run with: cargo bench --bench calibration_perf

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::ArrayD;
use talos_core::{calibrate_mask, fedavg, CalibrationConfig, ClientUpdate, FisherScores, GatherMode, ParameterSet, SparsityPolicy};

fn scores(layers: usize, width: usize) -> FisherScores {
    (0..layers)
        .map(|l| {
            let t = ArrayD::from_shape_fn(vec![width, width], |idx| {
                let (i, j) = (idx[0], idx[1]);
                (((i * 7919 + j * 104_729 + l * 31) % 10_007) as f32 / 10_007.0).powi(2)
            });
            (format!("layer{l}.weight"), t)
        })
        .collect()
}

fn bench_gather_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("calibrate_mask");
    for width in [64usize, 256] {
        let s = scores(4, width);
        group.throughput(Throughput::Elements(s.numel() as u64));
        for gather in [GatherMode::Materialize, GatherMode::Recompute] {
            let cfg = CalibrationConfig { target_sparsity: 0.9, rounds: 3, policy: SparsityPolicy::Global, dynamic: true, gather };
            group.bench_with_input(BenchmarkId::new(format!("{gather:?}"), width), &s, |b, s| {
                b.iter(|| black_box(calibrate_mask(s, &cfg).unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_layer_wise(c: &mut Criterion) {
    let s = scores(8, 128);
    let cfg = CalibrationConfig { target_sparsity: 0.95, rounds: 5, policy: SparsityPolicy::LayerWise, dynamic: false, gather: GatherMode::Materialize };
    c.bench_function("calibrate_mask_layer_wise_8x128", |b| b.iter(|| black_box(calibrate_mask(&s, &cfg).unwrap())));
}

fn bench_fedavg(c: &mut Criterion) {
    let updates: Vec<ClientUpdate> = (0..10)
        .map(|client| {
            let params: ParameterSet = (0..4)
                .map(|l| (format!("layer{l}.weight"), ArrayD::from_elem(vec![256, 256], client as f32 * 0.1 + l as f32)))
                .collect();
            ClientUpdate::new(client, params, 100 + client as u64)
        })
        .collect();
    c.bench_function("fedavg_10_clients_4x256x256", |b| b.iter(|| black_box(fedavg(&updates).unwrap())));
}

criterion_group!(benches, bench_gather_modes, bench_layer_wise, bench_fedavg);
criterion_main!(benches);
