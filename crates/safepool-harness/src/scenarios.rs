//! Self-checking scenarios over the runtime's core properties.
//!
//! Each scenario gets a fresh diagnostic [`Runtime`], drives it through a
//! deterministic sequence and returns `Err` with a description at the first
//! broken expectation. Violations the runtime reports along the way are
//! collected and logged, whether they were expected or not.

use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;

use safepool_membrane::rewrite::OobRewriter;
use safepool_membrane::{
    IndexingMode, MetricsSnapshot, PointerMetadata, Runtime, RuntimeConfig, Violation,
    ViolationKind,
};

use crate::HarnessError;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

macro_rules! ensure {
    ($cond:expr, $($fmt:tt)+) => {
        if !$cond {
            return Err(format!($($fmt)+));
        }
    };
}

/// Deterministic xorshift64* stream.
#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

// ---------------------------------------------------------------------------
// Scenario plumbing
// ---------------------------------------------------------------------------

/// Runtime plus the violations a scenario has observed so far.
pub struct ScenarioContext {
    runtime: Runtime,
    observed: Vec<Violation>,
}

impl ScenarioContext {
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Drain pending violations and return their kinds in report order.
    pub fn take_kinds(&mut self) -> Vec<ViolationKind> {
        let drained = self.runtime.drain_violations();
        let kinds = drained.iter().map(|v| v.kind).collect();
        self.observed.extend(drained);
        kinds
    }

    /// Drain pending violations and return them whole.
    pub fn take(&mut self) -> Vec<Violation> {
        let drained = self.runtime.drain_violations();
        self.observed.extend(drained.iter().cloned());
        drained
    }
}

type ScenarioFn = fn(&mut ScenarioContext) -> Result<(), String>;

/// A named property check.
#[derive(Clone, Copy)]
pub struct Scenario {
    pub id: &'static str,
    pub property: &'static str,
    pub indexing: IndexingMode,
    run: ScenarioFn,
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("id", &self.id)
            .field("indexing", &self.indexing)
            .finish_non_exhaustive()
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub id: String,
    pub property: String,
    pub indexing: IndexingMode,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub violations: Vec<ViolationKind>,
    pub duration_us: u64,
    pub metrics: MetricsSnapshot,
}

impl ScenarioResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

/// Every built-in scenario, in execution order.
#[must_use]
pub fn all() -> Vec<Scenario> {
    vec![
        Scenario {
            id: "allocation-coherence",
            property: "registry agrees with the allocator over arbitrary alloc/free sequences",
            indexing: IndexingMode::OnePastEnd,
            run: allocation_coherence,
        },
        Scenario {
            id: "rewrite-round-trip",
            property: "unrewrite(rewrite(p)) == p and sentinels are never reissued",
            indexing: IndexingMode::Rewrite,
            run: rewrite_round_trip,
        },
        Scenario {
            id: "bounds-idempotence",
            property: "check_index(x, x) succeeds for every registered x",
            indexing: IndexingMode::OnePastEnd,
            run: bounds_idempotence,
        },
        Scenario {
            id: "one-past-end",
            property: "one-past-end index yields a sentinel unless indexing is strict",
            indexing: IndexingMode::OnePastEnd,
            run: one_past_end,
        },
        Scenario {
            id: "one-past-end-strict",
            property: "strict indexing reports one-past-end results",
            indexing: IndexingMode::Strict,
            run: one_past_end_strict,
        },
        Scenario {
            id: "dangling-detection",
            property: "dereference after free reports a dangling pointer with epochs",
            indexing: IndexingMode::OnePastEnd,
            run: dangling_detection,
        },
        Scenario {
            id: "temporal-reuse",
            property: "a recycled lock slot rejects the stale key and accepts the new one",
            indexing: IndexingMode::OnePastEnd,
            run: temporal_reuse,
        },
        Scenario {
            id: "metadata-round-trip",
            property: "metadata load returns the stored tuple and zero for untouched slots",
            indexing: IndexingMode::OnePastEnd,
            run: metadata_round_trip,
        },
        Scenario {
            id: "end-to-end",
            property: "alloc, in-bounds index, one-past-end sentinel, free, dangling dereference",
            indexing: IndexingMode::OnePastEnd,
            run: end_to_end,
        },
    ]
}

/// Look up a scenario by id.
pub fn find(id: &str) -> Result<Scenario, HarnessError> {
    all()
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| HarnessError::UnknownScenario(id.to_string()))
}

/// Runs scenarios against fresh runtimes and logs every step.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    base: RuntimeConfig,
}

impl Default for ScenarioRunner {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ScenarioRunner {
    /// `dangling` turns on the page-remap detector where the build supports it.
    #[must_use]
    pub fn new(dangling: bool) -> Self {
        Self {
            base: RuntimeConfig::diagnostic().with_dangling(dangling),
        }
    }

    /// Run one scenario. Setup failures are errors; broken expectations are
    /// a failed result.
    pub fn run_one(
        &self,
        scenario: &Scenario,
        log: &mut LogEmitter,
    ) -> Result<ScenarioResult, HarnessError> {
        let config = self.base.clone().with_indexing(scenario.indexing);
        let mode = config.mode.as_str();
        let indexing = scenario.indexing.as_str();
        log.emit_entry(
            LogEntry::new(String::new(), LogLevel::Info, "scenario_start")
                .with_scenario(scenario.id)
                .with_modes(mode, indexing),
        )?;

        let mut ctx = ScenarioContext {
            runtime: Runtime::quiet(config)?,
            observed: Vec::new(),
        };
        let started = Instant::now();
        let verdict = (scenario.run)(&mut ctx);
        let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        ctx.take();

        for violation in &ctx.observed {
            log.emit_entry(
                LogEntry::new(String::new(), LogLevel::Warn, "violation")
                    .with_scenario(scenario.id)
                    .with_violation(violation),
            )?;
        }

        let (outcome, failure) = match verdict {
            Ok(()) => (Outcome::Pass, None),
            Err(reason) => (Outcome::Fail, Some(reason)),
        };
        let mut end = LogEntry::new(
            String::new(),
            if outcome == Outcome::Pass {
                LogLevel::Info
            } else {
                LogLevel::Error
            },
            "scenario_end",
        )
        .with_scenario(scenario.id)
        .with_modes(mode, indexing)
        .with_outcome(outcome)
        .with_duration_us(duration_us);
        if let Some(reason) = &failure {
            end = end.with_details(serde_json::json!({ "failure": reason }));
        }
        log.emit_entry(end)?;

        let metrics = ctx.runtime.metrics();
        Ok(ScenarioResult {
            id: scenario.id.to_string(),
            property: scenario.property.to_string(),
            indexing: scenario.indexing,
            outcome,
            failure,
            violations: ctx.observed.iter().map(|v| v.kind).collect(),
            duration_us,
            metrics,
        })
    }

    /// Run every scenario whose id contains `filter` (all when `None`).
    pub fn run(
        &self,
        filter: Option<&str>,
        log: &mut LogEmitter,
    ) -> Result<Vec<ScenarioResult>, HarnessError> {
        let selected: Vec<_> = all()
            .into_iter()
            .filter(|s| filter.is_none_or(|f| s.id.contains(f)))
            .collect();
        if selected.is_empty() {
            return Err(HarnessError::UnknownScenario(
                filter.unwrap_or_default().to_string(),
            ));
        }
        let mut results = Vec::with_capacity(selected.len());
        for scenario in &selected {
            results.push(self.run_one(scenario, log)?);
        }
        log.flush()?;
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

fn allocation_coherence(ctx: &mut ScenarioContext) -> Result<(), String> {
    const SLOTS: usize = 24;
    let rt = ctx.runtime();
    let mut pool = rt.pool_init(16);
    let mut rng = XorShift64::new(0x5afe_9001);
    let mut live: [Option<(usize, usize)>; SLOTS] = [None; SLOTS];

    for step in 0..2_000 {
        let idx = rng.below(SLOTS);
        match (rng.below(3), live[idx]) {
            (0 | 1, None) => {
                let size = if rng.below(16) == 0 {
                    4096 + rng.below(8192)
                } else {
                    1 + rng.below(256)
                };
                let p = rt
                    .pool_alloc(&mut pool, size)
                    .ok_or_else(|| format!("step {step}: allocation of {size} bytes failed"))?;
                live[idx] = Some((p, size));
            }
            (0 | 1, Some((p, size))) => {
                ensure!(
                    pool.retrieve(p + size - 1) == Some((p, size)),
                    "step {step}: last byte of {p:#x} resolves to {:?}",
                    pool.retrieve(p + size - 1)
                );
                let inner = p + rng.below(size);
                ensure!(
                    rt.try_check_index(&pool, p, inner) == Ok(inner),
                    "step {step}: in-bounds index {inner:#x} rejected"
                );
            }
            (_, Some((p, _))) => {
                rt.pool_free(&mut pool, p);
                live[idx] = None;
            }
            (_, None) => {}
        }

        let expected = live.iter().flatten().count();
        ensure!(
            pool.live_objects() == expected,
            "step {step}: registry holds {} objects, expected {expected}",
            pool.live_objects()
        );
    }

    let mut spans: Vec<_> = live.iter().flatten().copied().collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        ensure!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "live objects {:#x} and {:#x} overlap",
            pair[0].0,
            pair[1].0
        );
    }
    for (p, _) in spans {
        rt.pool_free(&mut pool, p);
    }
    let stats = rt.pool_destroy(pool);
    ensure!(stats.live_nodes == 0, "{} nodes leaked", stats.live_nodes);
    ensure!(ctx.take_kinds().is_empty(), "coherent sequence reported violations");
    Ok(())
}

fn rewrite_round_trip(ctx: &mut ScenarioContext) -> Result<(), String> {
    let mut rewriter = OobRewriter::new(1 << 16).map_err(|e| e.to_string())?;
    let mut seen = HashSet::new();
    for i in 0..1_000usize {
        let original = 0x40_0000 + i * 40;
        let sentinel = rewriter
            .rewrite(original, original - 40, original)
            .map_err(|e| e.to_string())?;
        ensure!(seen.insert(sentinel), "sentinel {sentinel:#x} issued twice");
        let back = rewriter.unrewrite(sentinel).map_err(|e| e.to_string())?;
        ensure!(back == original, "sentinel {sentinel:#x} maps to {back:#x}");
    }

    // Through the runtime: an out-of-bounds walk comes back in bounds.
    let rt = ctx.runtime();
    let mut pool = rt.pool_init(8);
    let p = rt.pool_alloc(&mut pool, 64).ok_or("allocation failed")?;
    let far = rt.check_index(&pool, p, p + 4096);
    ensure!(rt.is_sentinel(far), "far index {far:#x} was not rewritten");
    ensure!(
        rt.get_original_value(far) == p + 4096,
        "sentinel does not restore the original value"
    );
    // Arithmetic on the sentinel is relative to the value it stands for.
    let back = rt.check_index(&pool, far, far - 4088);
    ensure!(back == p + 8, "walking back in bounds produced {back:#x}");
    let _ = rt.pool_destroy(pool);
    ensure!(ctx.take_kinds().is_empty(), "rewrite mode reported violations");
    Ok(())
}

fn bounds_idempotence(ctx: &mut ScenarioContext) -> Result<(), String> {
    let rt = ctx.runtime();
    let mut pool = rt.pool_init(32);
    let mut rng = XorShift64::new(7);
    let mut stack_object = [0u8; 48];
    let registered = stack_object.as_mut_ptr() as usize;
    rt.pool_register(&mut pool, registered, stack_object.len());

    let mut addrs = vec![registered, registered + 47];
    for _ in 0..64 {
        let size = 1 + rng.below(512);
        let p = rt.pool_alloc(&mut pool, size).ok_or("allocation failed")?;
        addrs.push(p);
        addrs.push(p + rng.below(size));
    }
    for x in addrs {
        ensure!(
            rt.try_check_index(&pool, x, x) == Ok(x),
            "check_index({x:#x}, {x:#x}) failed"
        );
    }
    ensure!(rt.pool_unregister(&mut pool, registered), "unregister failed");
    let _ = rt.pool_destroy(pool);
    ensure!(ctx.take_kinds().is_empty(), "idempotent checks reported violations");
    Ok(())
}

fn one_past_end(ctx: &mut ScenarioContext) -> Result<(), String> {
    let rt = ctx.runtime();
    let mut pool = rt.pool_init(8);
    let base = rt.pool_alloc(&mut pool, 24).ok_or("allocation failed")?;
    let end = rt.check_index(&pool, base, base + 24);
    ensure!(end != base + 24, "one-past-end pointer was returned raw");
    ensure!(rt.is_sentinel(end), "one-past-end result {end:#x} is not a sentinel");
    ensure!(ctx.take_kinds().is_empty(), "one-past-end was reported");

    let rt = ctx.runtime();
    let _ = rt.check_index(&pool, base, base + 25);
    let kinds = ctx.take_kinds();
    ensure!(
        kinds == [ViolationKind::OutOfBounds],
        "two past the end reported {kinds:?}"
    );
    let _ = ctx.runtime().pool_destroy(pool);
    Ok(())
}

fn one_past_end_strict(ctx: &mut ScenarioContext) -> Result<(), String> {
    let rt = ctx.runtime();
    let mut pool = rt.pool_init(8);
    let base = rt.pool_alloc(&mut pool, 24).ok_or("allocation failed")?;
    let end = rt.check_index(&pool, base, base + 24);
    ensure!(!rt.is_sentinel(end), "strict indexing issued a sentinel");
    let kinds = ctx.take_kinds();
    ensure!(
        kinds == [ViolationKind::OutOfBounds],
        "strict one-past-end reported {kinds:?}"
    );
    let _ = ctx.runtime().pool_destroy(pool);
    Ok(())
}

fn dangling_detection(ctx: &mut ScenarioContext) -> Result<(), String> {
    let rt = ctx.runtime();
    let mut pool = rt.pool_init(16);
    let p = rt.pool_alloc(&mut pool, 16).ok_or("allocation failed")?;
    let keep = rt.pool_alloc(&mut pool, 16).ok_or("allocation failed")?;
    rt.pool_free(&mut pool, p);
    rt.check_dereference(&pool, p + 4);
    rt.check_dereference(&pool, keep);

    let found = ctx.take();
    ensure!(found.len() == 1, "expected one report, got {}", found.len());
    let report = &found[0];
    ensure!(
        report.kind == ViolationKind::DanglingPointer,
        "freed object reported as {}",
        report.kind
    );
    let prov = report.provenance.ok_or("dangling report carries no provenance")?;
    let freed = prov.free_epoch.ok_or("provenance has no free epoch")?;
    ensure!(
        freed >= prov.alloc_epoch,
        "free epoch {freed} precedes allocation epoch {}",
        prov.alloc_epoch
    );
    let _ = ctx.runtime().pool_destroy(pool);
    Ok(())
}

fn temporal_reuse(ctx: &mut ScenarioContext) -> Result<(), String> {
    let rt = ctx.runtime();
    let object = 0x5000_0000;
    let first = rt.heap_memory_allocation(object);
    rt.memory_deallocation(object, first.key, first.lock);
    let second = rt.heap_memory_allocation(object);
    ensure!(second.lock == first.lock, "lock slot was not recycled");
    ensure!(second.key != first.key, "key was reused");

    rt.temporal_load_check(second.key, second.lock);
    ensure!(ctx.take_kinds().is_empty(), "fresh key rejected");
    ctx.runtime().temporal_load_check(first.key, first.lock);
    let kinds = ctx.take_kinds();
    ensure!(
        kinds == [ViolationKind::TemporalViolation],
        "stale key reported {kinds:?}"
    );
    Ok(())
}

fn metadata_round_trip(ctx: &mut ScenarioContext) -> Result<(), String> {
    let rt = ctx.runtime();
    let mut rng = XorShift64::new(0xfeed);
    let mut stored = Vec::new();
    for _ in 0..128 {
        let slot = (0x7e00_0000_0000 + rng.below(1 << 24)) & !7;
        let meta = PointerMetadata {
            base: rng.below(1 << 40),
            bound: rng.below(1 << 40),
            key: rng.below(1 << 20) + 2,
            lock: rng.below(1 << 40),
        };
        rt.metadata_store(slot, meta);
        stored.retain(|(s, _)| *s != slot);
        stored.push((slot, meta));
    }
    for (slot, meta) in &stored {
        let loaded = rt.metadata_load(*slot);
        ensure!(loaded == *meta, "slot {slot:#x} loaded {loaded:?}");
    }
    let untouched = rt.metadata_load(0x1000);
    ensure!(
        untouched == PointerMetadata::default(),
        "untouched slot loaded {untouched:?}"
    );
    ensure!(ctx.take_kinds().is_empty(), "metadata traffic reported violations");
    Ok(())
}

fn end_to_end(ctx: &mut ScenarioContext) -> Result<(), String> {
    let rt = ctx.runtime();
    let mut pool = rt.pool_init(8);
    let p = rt.pool_alloc(&mut pool, 40).ok_or("allocation failed")?;
    ensure!(rt.check_index(&pool, p, p + 36) == p + 36, "in-bounds index changed");
    let past = rt.check_index(&pool, p, p + 40);
    ensure!(rt.is_sentinel(past), "one-past-end was not rewritten");
    ensure!(pool.retrieve(past).is_none(), "sentinel resolves to a heap object");
    rt.pool_free(&mut pool, p);
    rt.check_dereference(&pool, p);
    let kinds = ctx.take_kinds();
    ensure!(
        kinds == [ViolationKind::DanglingPointer],
        "dereference after free reported {kinds:?}"
    );
    let _ = ctx.runtime().pool_destroy(pool);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_ids_are_unique() {
        let scenarios = all();
        let ids: HashSet<_> = scenarios.iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), scenarios.len());
    }

    #[test]
    fn find_rejects_unknown_ids() {
        assert!(find("end-to-end").is_ok());
        assert!(matches!(
            find("nope"),
            Err(HarnessError::UnknownScenario(id)) if id == "nope"
        ));
    }

    #[test]
    fn xorshift_below_stays_in_range() {
        let mut rng = XorShift64::new(0);
        assert!((0..1000).all(|_| rng.below(7) < 7));
    }
}
