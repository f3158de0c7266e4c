// VortexSort throughput benchmarks across input sizes that span the
// small-bucket leaf path and the full MSD-radix recursion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vortex::harness::Lcg;
use vortex::{VortexSort, VortexSortConfig};

fn uniform_keys(n: usize) -> Vec<u64> {
    let mut lcg = Lcg::new((17, 29, 41, 53), 64);
    let mut keys = vec![0u64; n];
    lcg.fill(&mut keys);
    keys
}

fn bench_sort_by_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_uniform_keys");

    for n in [64usize, 1 << 12, 1 << 18] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let sort = VortexSort::new(n as u64, VortexSortConfig::default()).unwrap();
            let input = uniform_keys(n);
            let mut output = vec![0u64; n];

            b.iter(|| {
                sort.sort(black_box(&input), &mut output);
            });
        });
    }

    group.finish();
}

fn bench_sort_identical_keys(c: &mut Criterion) {
    let n = 1 << 16;
    let sort = VortexSort::new(n as u64, VortexSortConfig::default()).unwrap();
    let input = vec![0xDEAD_BEEF_CAFE_F00Du64; n];
    let mut output = vec![0u64; n];

    c.bench_function("sort_identical_keys", |b| {
        b.iter(|| {
            sort.sort(black_box(&input), &mut output);
        });
    });
}

criterion_group!(benches, bench_sort_by_size, bench_sort_identical_keys);
criterion_main!(benches);
