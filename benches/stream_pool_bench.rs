// StreamPool hot-path benchmarks: frame acquisition/return and the
// map/unmap round trip that every fault handler calls on its hot path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vortex::StreamPool;

fn bench_get_and_return_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_and_return_block");

    for num_pages in [1u64, 8, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(num_pages), &num_pages, |b, &num_pages| {
            let pool = StreamPool::new(12, 21).unwrap();
            pool.adjust_pool_physical_memory(num_pages * 32).unwrap();

            b.iter(|| {
                let frames = pool.get_new_block(black_box(num_pages)).unwrap();
                pool.return_free_block(frames);
            });
        });
    }

    group.finish();
}

fn bench_map_unmap_round_trip(c: &mut Criterion) {
    let pool = StreamPool::new(12, 21).unwrap();
    pool.adjust_pool_physical_memory(pool.pages_per_block * 4).unwrap();
    let bc = pool.buffer_alloc(pool.block_size, pool.block_size, 0).unwrap();

    c.bench_function("map_unmap_one_block", |b| {
        b.iter(|| {
            let frames = pool.get_new_block(pool.pages_per_block).unwrap();
            pool.map_block(&bc, bc.user_base, &frames).unwrap();
            pool.unmap_block(&bc, bc.user_base, &frames).unwrap();
            pool.return_free_block(frames);
        });
    });
}

fn bench_buffer_alloc(c: &mut Criterion) {
    let pool = StreamPool::new(12, 21).unwrap();

    c.bench_function("buffer_alloc", |b| {
        b.iter(|| {
            let bc = pool.buffer_alloc(black_box(1 << 20), 1 << 20, 0).unwrap();
            black_box(&bc);
        });
    });
}

criterion_group!(benches, bench_get_and_return_block, bench_map_unmap_round_trip, bench_buffer_alloc);
criterion_main!(benches);
