use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;

use statespace::kalman::KalmanFilter;
use statespace::models::GaussianModel;
use statespace::particle::GaussianParticle;
use statespace::prior::{Prior, PriorSpec};

fn local_level(n: usize) -> GaussianModel {
    let prior = PriorSpec::new(vec![
        Prior::HalfNormal { sd: 2.0 },
        Prior::HalfNormal { sd: 2.0 },
    ])
    .unwrap();
    let y = DVector::from_fn(n, |t, _| (t as f64 * 0.1).sin() + 0.05 * t as f64);
    GaussianModel::local_level(y, 0.5, 0.3, 0.0, 2.0, prior).unwrap()
}

fn kalman_filter(c: &mut Criterion) {
    let model = local_level(200);

    c.bench_function("log_likelihood_200", |b| {
        b.iter(|| black_box(model.log_likelihood()))
    });

    c.bench_function("smoother_200", |b| b.iter(|| black_box(model.smoother())));

    c.bench_function("simulation_smoother_200", |b| {
        let mut rng = StdRng::seed_from_u64(1);
        b.iter(|| black_box(model.simulation_smoother(1, &mut rng).unwrap()))
    });

    c.bench_function("bsf_filter_200x500", |b| {
        let mut rng = StdRng::seed_from_u64(2);
        b.iter(|| black_box(model.bsf_filter(500, &mut rng).unwrap()))
    });
}

criterion_group!(benches, kalman_filter);
criterion_main!(benches);
