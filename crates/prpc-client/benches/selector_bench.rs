// Criterion benchmarks for the prpc endpoint selectors
//
// Run benchmarks with:
//   cargo bench -p prpc-client
//
// For detailed output with plots:
//   cargo bench -p prpc-client -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use prpc_client::{SelectType, Selector, ServiceOption, ServiceOptions, Weighted};

struct Candidate {
    weight: u32,
}

impl Weighted for Candidate {
    fn weight(&self) -> u32 {
        self.weight
    }
}

fn candidates(count: usize) -> Vec<Candidate> {
    (0..count)
        .map(|i| Candidate {
            weight: 10 + (i as u32 % 7) * 5,
        })
        .collect()
}

fn bench_select(c: &mut Criterion) {
    for kind in [
        SelectType::Random,
        SelectType::WeightedRandom,
        SelectType::RoundRobin,
        SelectType::Specified,
    ] {
        let mut group = c.benchmark_group(format!("select_{}", kind));
        for count in [2, 10, 50, 200].iter() {
            group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
                let list = candidates(count);
                let selector = Selector::new(kind, Some(count / 2));
                b.iter(|| black_box(selector.select(black_box(&list))).is_some());
            });
        }
        group.finish();
    }
}

fn bench_round_robin_distribution(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_robin_distribution");

    group.bench_function("10_endpoints_100_calls", |b| {
        let list = candidates(10);
        b.iter(|| {
            let selector = Selector::new(SelectType::RoundRobin, None);
            for _ in 0..100 {
                black_box(selector.select(&list));
            }
        });
    });

    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");

    group.bench_function("default_options", |b| {
        let options = ServiceOptions::default();
        b.iter(|| options.fingerprint(black_box("Arith"), black_box("zone1")));
    });

    group.bench_function("resolve_and_hash", |b| {
        b.iter(|| {
            let options = ServiceOptions::resolve([
                ServiceOption::VersionAll,
                ServiceOption::SelectType(SelectType::RoundRobin),
            ])
            .unwrap();
            black_box(options.fingerprint("Arith", "zone1"))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_select,
    bench_round_robin_distribution,
    bench_fingerprint
);
criterion_main!(benches);
