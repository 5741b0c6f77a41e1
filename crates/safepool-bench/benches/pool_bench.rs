//! Pool allocator benchmarks.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use safepool_membrane::{Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    Runtime::quiet(RuntimeConfig::diagnostic().with_dangling(false)).expect("runtime")
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let rt = runtime();
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        let mut pool = rt.pool_init(64);
        group.bench_with_input(BenchmarkId::new("pool", size), &size, |b, &sz| {
            b.iter(|| {
                let p = rt.pool_alloc(&mut pool, sz).expect("alloc");
                rt.pool_free(&mut pool, black_box(p));
            });
        });
        let _ = rt.pool_destroy(pool);

        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                black_box(v);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let mut pool = rt.pool_init(64);
            let ptrs: Vec<usize> = (0..1000)
                .map(|_| rt.pool_alloc(&mut pool, 64).expect("alloc"))
                .collect();
            black_box(&ptrs);
            black_box(rt.pool_destroy(pool));
        });
    });

    group.bench_function("stack_frame_16x32B", |b| {
        let mut pool = rt.pool_init(32);
        b.iter(|| {
            rt.pool_newstack(&mut pool).expect("frame");
            for _ in 0..16 {
                black_box(rt.pool_alloca(&mut pool, 32));
            }
            black_box(rt.pool_delstack(&mut pool));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_burst);
criterion_main!(benches);
