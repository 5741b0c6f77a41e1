//! Check engine overhead benchmarks.
//!
//! Measures the per-call cost of index and dereference checks at each
//! lookup stage, plus the exported entry point on top of them.

use std::cell::RefCell;
use std::ffi::c_void;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use safepool_abi::check_abi::safepool_boundscheck;
use safepool_abi::pool_abi::{safepool_poolalloc, safepool_pooldestroy, safepool_poolinit};
use safepool_membrane::{IndexingMode, Runtime, RuntimeConfig};

#[derive(Default)]
struct BenchStats {
    samples_ns_per_op: Vec<f64>,
    total_iters: u64,
    total_ns: u128,
}

impl BenchStats {
    fn record(&mut self, iters: u64, dur: Duration) {
        let ns = dur.as_nanos();
        self.total_iters = self.total_iters.saturating_add(iters);
        self.total_ns = self.total_ns.saturating_add(ns);
        self.samples_ns_per_op.push(ns as f64 / iters as f64);
    }

    fn report(&self, bench_label: &str) {
        let mut samples = self.samples_ns_per_op.clone();
        if samples.is_empty() {
            return;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p50 = percentile_sorted(&samples, 0.50);
        let p99 = percentile_sorted(&samples, 0.99);
        let throughput_ops_s = if self.total_ns == 0 {
            0.0
        } else {
            (self.total_iters as f64) / (self.total_ns as f64 / 1e9)
        };
        println!(
            "CHECK_BENCH bench={bench_label} samples={} p50_ns_op={p50:.3} p99_ns_op={p99:.3} throughput_ops_s={throughput_ops_s:.3}",
            samples.len()
        );
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn maybe_pin_thread() {
    if std::env::var("SAFEPOOL_BENCH_PIN").ok().as_deref() != Some("1") {
        return;
    }

    #[cfg(target_os = "linux")]
    unsafe {
        // SAFETY: best-effort pinning; failure is reported and ignored.
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(0, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            eprintln!("CHECK_BENCH_META pinning_failed");
        }
    }
}

/// Time `op` with `iter_custom` and print percentiles after the run.
fn timed<F: Fn()>(group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>, label: &str, op: F) {
    for _ in 0..10_000 {
        op();
    }
    let stats = RefCell::new(BenchStats::default());
    group.bench_function(BenchmarkId::from_parameter(label), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _ in 0..iters {
                op();
            }
            let dur = start.elapsed().max(Duration::from_nanos(1));
            stats.borrow_mut().record(iters, dur);
            dur
        });
    });
    stats.borrow().report(label);
}

fn bench_checks(c: &mut Criterion) {
    maybe_pin_thread();
    let rt = Runtime::quiet(
        RuntimeConfig::diagnostic()
            .with_dangling(false)
            .with_indexing(IndexingMode::Rewrite),
    )
    .expect("runtime");
    let mut pool = rt.pool_init(32);
    // A populated registry so lookups are not trivially shallow.
    let objects: Vec<usize> = (0..4096)
        .map(|_| rt.pool_alloc(&mut pool, 32).expect("alloc"))
        .collect();
    let hot = objects[2048];
    let sentinel = rt.check_index(&pool, hot, hot + 4096);

    let mut group = c.benchmark_group("check");
    group.throughput(Throughput::Elements(1));

    timed(&mut group, "index_in_bounds", || {
        black_box(rt.check_index(&pool, black_box(hot), black_box(hot + 16)));
    });
    timed(&mut group, "dereference_live", || {
        rt.check_dereference(&pool, black_box(hot + 8));
    });
    timed(&mut group, "index_from_sentinel", || {
        black_box(rt.check_index(&pool, black_box(sentinel), black_box(sentinel - 4088)));
    });
    timed(&mut group, "dereference_incomplete_foreign", || {
        rt.check_dereference_incomplete(&pool, black_box(0x7e00_0000_1000));
    });
    group.finish();

    for p in objects {
        rt.pool_free(&mut pool, p);
    }
    let _ = rt.pool_destroy(pool);
}

fn bench_abi(c: &mut Criterion) {
    // SAFETY: the handle and object come from the entry points themselves and
    // stay alive for the whole group.
    unsafe {
        let pool = safepool_poolinit(64);
        let obj = safepool_poolalloc(pool, 64);
        if obj.is_null() {
            safepool_pooldestroy(pool);
            return;
        }
        let dst = obj.cast::<u8>().add(32).cast::<c_void>();
        let mut group = c.benchmark_group("abi");
        group.throughput(Throughput::Elements(1));
        timed(&mut group, "boundscheck", || {
            black_box(safepool_boundscheck(pool, black_box(obj), black_box(dst)));
        });
        group.finish();
        safepool_pooldestroy(pool);
    }
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(1))
        .measurement_time(Duration::from_secs(2))
        .sample_size(100);
    targets = bench_checks, bench_abi
);
criterion_main!(benches);
