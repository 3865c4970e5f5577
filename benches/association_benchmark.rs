use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regulon::association::{AssociationEngine, DEFAULT_BINS, Discretization, background_correct};

const SAMPLES: usize = 200;

fn random_matrix(rows: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(0x5EED_A55 + seed);
    Array2::from_shape_fn((rows, SAMPLES), |_| rng.sample(Standard))
}

fn benchmark_mutual_information(c: &mut Criterion) {
    let sizes = [50_usize, 100, 200];
    let mut group = c.benchmark_group("association");
    for &size in &sizes {
        let design = random_matrix(size, 1);
        let response = random_matrix(size, 2);
        group.throughput(Throughput::Elements((size * size) as u64));

        for discretization in [Discretization::EqualWidth, Discretization::EqualFrequency] {
            let engine = AssociationEngine::new(DEFAULT_BINS, discretization);
            let label = format!("{discretization:?}");
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, _| {
                b.iter(|| {
                    let scores = engine.compute(black_box(design.view()), black_box(response.view()));
                    black_box(scores);
                });
            });
        }

        let engine = AssociationEngine::new(DEFAULT_BINS, Discretization::EqualWidth);
        let raw = engine.compute(design.view(), response.view()).raw;
        let flags = vec![false; size];
        group.bench_with_input(BenchmarkId::new("background_correct", size), &raw, |b, raw| {
            b.iter(|| black_box(background_correct(black_box(raw.view()), &flags, &flags)));
        });
    }
    group.finish();
}

criterion_group!(association, benchmark_mutual_information);
criterion_main!(association);
