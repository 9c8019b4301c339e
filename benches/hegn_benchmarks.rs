//! Benchmarks for graph construction and the HEGN forward pass

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hegn::core::geometry::rotation_about_axis;
use hegn::core::{PairedBatch, PointBatch};
use hegn::dnn::{graph_feature, knn};
use hegn::registration::{Hegn, HegnConfig};
use nalgebra::Vector3;
use ndarray::{Array3, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

fn random_features(rng: &mut StdRng, channels: usize, n: usize) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(&[2, channels, 3, n]), |_| rng.gen_range(-1.0f32..1.0))
}

fn benchmark_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph");
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(20);

    let mut rng = StdRng::seed_from_u64(0);
    for n in [256usize, 1024] {
        let x = random_features(&mut rng, 32, n);
        group.bench_with_input(BenchmarkId::new("knn", n), &x, |b, x| {
            b.iter(|| knn(black_box(x), 16))
        });
        group.bench_with_input(BenchmarkId::new("graph_feature", n), &x, |b, x| {
            b.iter(|| graph_feature(black_box(x), 16))
        });
    }
    group.finish();
}

fn benchmark_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("hegn_forward");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(10);

    let mut rng = StdRng::seed_from_u64(1);
    let Ok(model) = Hegn::new(HegnConfig::default(), &mut rng) else {
        return;
    };
    let r = rotation_about_axis(&Vector3::z(), 0.7);

    for n in [256usize, 1024] {
        let x = Array3::from_shape_fn((2, n, 3), |_| rng.gen_range(-1.0f32..1.0));
        let mut y = x.clone();
        for mut p in y.lanes_mut(ndarray::Axis(2)) {
            let v = Vector3::new(p[0], p[1], p[2]).transpose() * r;
            p[0] = v[0];
            p[1] = v[1];
            p[2] = v[2];
        }
        let (Ok(xb), Ok(yb)) = (PointBatch::new(x), PointBatch::new(y)) else {
            continue;
        };
        let Ok(batch) = PairedBatch::new(xb, yb) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::new("cpu", n), &batch, |b, batch| {
            b.iter(|| model.forward(black_box(batch)))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_graph, benchmark_forward);
criterion_main!(benches);
