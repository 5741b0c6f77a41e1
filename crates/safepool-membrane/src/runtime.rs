//! The runtime context.
//!
//! A [`Runtime`] holds every piece of state the checks share: configuration,
//! the sentinel rewriter, the external-object registry, allocation and free
//! epochs, the report sink, metrics and the pointer-metadata backend. Pools
//! are created by the runtime but owned by the caller, which passes them by
//! `&mut` to allocate and free and by `&` to check.
//!
//! Most operations come in three flavors:
//! - `try_*` returns the [`Violation`] and leaves enforcement to the caller
//! - `*_at` enforces with an explicit [`SourceSite`]
//! - the plain name enforces with the caller's Rust source location

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::dangling::{self, ShadowPages};
use crate::error::RuntimeError;
use crate::metrics::{MetricsSnapshot, RuntimeMetrics};
use crate::pool::Pool;
use crate::provenance::SourceSite;
use crate::registry::ObjectRegistry;
use crate::report::ReportSink;
use crate::rewrite::{OobRewriter, SentinelRange};
use crate::slab::PoolStats;
use crate::softbound::SoftBound;
use crate::violation::{ObjectBounds, Violation, ViolationKind};

static NEXT_RUNTIME: AtomicU64 = AtomicU64::new(1);

pub struct Runtime {
    id: u64,
    config: RuntimeConfig,
    sentinels: SentinelRange,
    rewriter: Mutex<OobRewriter>,
    external: RwLock<ObjectRegistry<()>>,
    alloc_epoch: AtomicU64,
    free_epoch: AtomicU64,
    next_pool: AtomicU64,
    sink: ReportSink,
    metrics: RuntimeMetrics,
    softbound: SoftBound,
}

impl Runtime {
    /// Build a runtime that reports to stderr and to the configured log.
    pub fn init(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let sink = ReportSink::open(config.report_log.as_deref())?;
        Self::with_sink(config, sink)
    }

    /// Build a runtime reporting into `sink`.
    pub fn with_sink(config: RuntimeConfig, sink: ReportSink) -> Result<Self, RuntimeError> {
        let rewriter = OobRewriter::new(config.sentinel_bytes)?;
        if config.dangling {
            dangling::ensure_fault_handler()?;
        }
        let softbound = SoftBound::new(&config.softbound)?;
        Ok(Self {
            id: NEXT_RUNTIME.fetch_add(1, Ordering::Relaxed),
            sentinels: rewriter.range(),
            rewriter: Mutex::new(rewriter),
            external: RwLock::new(ObjectRegistry::new()),
            alloc_epoch: AtomicU64::new(0),
            free_epoch: AtomicU64::new(0),
            next_pool: AtomicU64::new(1),
            sink,
            metrics: RuntimeMetrics::new(),
            softbound,
            config,
        })
    }

    /// Diagnostic runtime with compact tables that records violations
    /// without printing them.
    pub fn quiet(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_sink(config, ReportSink::quiet())
    }

    /// Tear the runtime down and return its final counters.
    pub fn shutdown(self) -> MetricsSnapshot {
        self.sync_traps();
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn counters(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub(crate) fn softbound(&self) -> &SoftBound {
        &self.softbound
    }

    #[must_use]
    pub fn sentinel_range(&self) -> SentinelRange {
        self.sentinels
    }

    #[must_use]
    pub fn is_sentinel(&self, addr: usize) -> bool {
        self.sentinels.contains(addr)
    }

    /// Violations reported so far (bounded history).
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.sink.recent()
    }

    pub fn drain_violations(&self) -> Vec<Violation> {
        self.sink.drain()
    }

    // -----------------------------------------------------------------------
    // Enforcement
    // -----------------------------------------------------------------------

    /// Apply the configured policy to a violation. Internal-consistency
    /// violations abort in every mode.
    pub fn enforce(&self, violation: Violation) {
        let fatal = violation.kind.always_fatal();
        if !fatal && !self.config.mode.checks_enabled() {
            return;
        }
        self.metrics.record_violation(violation.kind);
        self.sink.emit(&violation);
        if fatal || self.config.mode.terminates() {
            std::process::abort();
        }
    }

    /// Enforce the violation in `outcome`, if any, and fall back to
    /// `fallback` so execution can continue.
    pub(crate) fn settle<T>(
        &self,
        outcome: Result<T, Violation>,
        site: &SourceSite,
        fallback: T,
    ) -> T {
        match outcome {
            Ok(value) => value,
            Err(violation) => {
                self.enforce(violation.at(site));
                fallback
            }
        }
    }

    /// Fold traps taken by the fault handler into metrics and history. The
    /// handler already printed the alerts.
    pub fn sync_traps(&self) -> usize {
        let trapped = dangling::drain_traps(self.id);
        for record in &trapped {
            RuntimeMetrics::inc(&self.metrics.traps);
            self.metrics.record_violation(ViolationKind::DanglingPointer);
            let violation = Violation::new(ViolationKind::DanglingPointer, record.last_fault)
                .with_pc(record.last_pc)
                .with_object(ObjectBounds::new(record.object, record.object_len))
                .with_raw_provenance(record.provenance)
                .with_detail("trapped by the fault handler");
            self.sink.record(&violation);
        }
        trapped.len()
    }

    fn next_alloc_epoch(&self) -> u64 {
        self.alloc_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_free_epoch(&self) -> u64 {
        self.free_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    // -----------------------------------------------------------------------
    // Pools
    // -----------------------------------------------------------------------

    /// Create a pool for objects of `node_size` bytes.
    #[must_use]
    pub fn pool_init(&self, node_size: usize) -> Pool {
        let id = self.next_pool.fetch_add(1, Ordering::Relaxed);
        let shadows = self
            .config
            .dangling
            .then(|| ShadowPages::new(self.id, self.config.mode.terminates()));
        Pool::new(id, node_size, shadows)
    }

    /// Release every slab, alias and frame owned by `pool`.
    pub fn pool_destroy(&self, pool: Pool) -> PoolStats {
        let stats = pool.stats();
        drop(pool);
        stats
    }

    pub fn try_pool_alloc(
        &self,
        pool: &mut Pool,
        bytes: usize,
        site: SourceSite,
    ) -> Result<usize, RuntimeError> {
        let large = pool.needs_large_array(bytes);
        let addr = pool.allocate(bytes, self.next_alloc_epoch(), site)?;
        RuntimeMetrics::inc(&self.metrics.allocations);
        if large {
            RuntimeMetrics::inc(&self.metrics.large_arrays);
        }
        if pool.detects_dangling() {
            RuntimeMetrics::inc(&self.metrics.shadow_remaps);
        }
        Ok(addr)
    }

    /// Allocate `bytes` from `pool`. `None` when the OS refuses memory.
    #[track_caller]
    pub fn pool_alloc(&self, pool: &mut Pool, bytes: usize) -> Option<usize> {
        self.pool_alloc_at(pool, bytes, SourceSite::caller())
    }

    pub fn pool_alloc_at(&self, pool: &mut Pool, bytes: usize, site: SourceSite) -> Option<usize> {
        self.try_pool_alloc(pool, bytes, site).ok()
    }

    /// Allocate `count * size` zeroed bytes. `None` on overflow.
    #[track_caller]
    pub fn pool_calloc(&self, pool: &mut Pool, count: usize, size: usize) -> Option<usize> {
        self.pool_calloc_at(pool, count, size, SourceSite::caller())
    }

    pub fn pool_calloc_at(
        &self,
        pool: &mut Pool,
        count: usize,
        size: usize,
        site: SourceSite,
    ) -> Option<usize> {
        let bytes = count.checked_mul(size)?;
        let addr = self.pool_alloc_at(pool, bytes, site)?;
        // SAFETY: `addr` is a fresh allocation of at least `bytes` bytes.
        unsafe { Pool::zero_bytes(addr, bytes) };
        Some(addr)
    }

    /// Resize the object at `addr`, moving it. Null allocates; size 0 frees.
    #[track_caller]
    pub fn pool_realloc(&self, pool: &mut Pool, addr: usize, bytes: usize) -> Option<usize> {
        self.pool_realloc_at(pool, addr, bytes, SourceSite::caller())
    }

    pub fn pool_realloc_at(
        &self,
        pool: &mut Pool,
        addr: usize,
        bytes: usize,
        site: SourceSite,
    ) -> Option<usize> {
        if addr == 0 {
            return self.pool_alloc_at(pool, bytes, site);
        }
        if bytes == 0 {
            self.pool_free_at(pool, addr, site);
            return None;
        }
        let Some(old_len) = pool.live_len(addr) else {
            // Not a live heap object: let free classify and report it.
            self.pool_free_at(pool, addr, site);
            return None;
        };
        let fresh = self.pool_alloc_at(pool, bytes, site.clone())?;
        // SAFETY: both are live, distinct objects of at least the copied size.
        unsafe { Pool::copy_bytes(addr, fresh, old_len.min(bytes)) };
        self.pool_free_at(pool, addr, site);
        Some(fresh)
    }

    /// Copy a NUL-terminated string into `pool`.
    #[track_caller]
    pub fn pool_strdup(&self, pool: &mut Pool, text: &CStr) -> Option<usize> {
        self.pool_strdup_at(pool, text, SourceSite::caller())
    }

    pub fn pool_strdup_at(&self, pool: &mut Pool, text: &CStr, site: SourceSite) -> Option<usize> {
        let bytes = text.to_bytes_with_nul();
        let addr = self.pool_alloc_at(pool, bytes.len(), site)?;
        // SAFETY: `bytes` is readable and `addr` was just allocated with its length.
        unsafe { Pool::copy_bytes(bytes.as_ptr() as usize, addr, bytes.len()) };
        Some(addr)
    }

    pub fn try_pool_free(
        &self,
        pool: &mut Pool,
        addr: usize,
        site: SourceSite,
    ) -> Result<(), Violation> {
        if pool.free(addr, self.next_free_epoch(), site)?.is_some() {
            RuntimeMetrics::inc(&self.metrics.frees);
        }
        Ok(())
    }

    /// Free the object at `addr`. Invalid and double frees are reported.
    #[track_caller]
    pub fn pool_free(&self, pool: &mut Pool, addr: usize) {
        self.pool_free_at(pool, addr, SourceSite::caller());
    }

    pub fn pool_free_at(&self, pool: &mut Pool, addr: usize, site: SourceSite) {
        let outcome = self.try_pool_free(pool, addr, site.clone());
        self.settle(outcome, &site, ());
    }

    /// Register a program-owned object (a global or a stack variable).
    pub fn pool_register(&self, pool: &mut Pool, addr: usize, len: usize) {
        RuntimeMetrics::inc(&self.metrics.registrations);
        pool.register(addr, len);
    }

    pub fn pool_unregister(&self, pool: &mut Pool, addr: usize) -> bool {
        pool.unregister(addr)
    }

    /// Register an object allocated outside every pool.
    pub fn register_external(&self, addr: usize, len: usize) {
        RuntimeMetrics::inc(&self.metrics.registrations);
        self.external.write().insert(addr, len, ());
    }

    pub fn unregister_external(&self, addr: usize) -> bool {
        self.external.write().remove(addr).is_some()
    }

    /// Bounds of the external object containing `addr`.
    #[must_use]
    pub fn find_external(&self, addr: usize) -> Option<(usize, usize)> {
        self.external.read().retrieve(addr)
    }

    // -----------------------------------------------------------------------
    // Stack frames
    // -----------------------------------------------------------------------

    #[track_caller]
    pub fn pool_newstack(&self, pool: &mut Pool) -> Result<(), RuntimeError> {
        pool.new_stack(self.next_alloc_epoch(), SourceSite::caller())
    }

    #[track_caller]
    pub fn pool_alloca(&self, pool: &mut Pool, bytes: usize) -> Option<usize> {
        self.pool_alloca_at(pool, bytes, SourceSite::caller())
    }

    pub fn pool_alloca_at(&self, pool: &mut Pool, bytes: usize, site: SourceSite) -> Option<usize> {
        let addr = pool.alloca(bytes, self.next_alloc_epoch(), site)?;
        RuntimeMetrics::inc(&self.metrics.allocations);
        Some(addr)
    }

    /// Pop the innermost stack frame. Returns the objects released.
    #[track_caller]
    pub fn pool_delstack(&self, pool: &mut Pool) -> usize {
        let site = SourceSite::caller();
        let outcome = pool.del_stack(self.next_free_epoch(), site.clone());
        self.settle(outcome, &site, 0)
    }

    // -----------------------------------------------------------------------
    // Rewritten pointers
    // -----------------------------------------------------------------------

    pub(crate) fn issue_sentinel(
        &self,
        original: usize,
        obj_start: usize,
        obj_end: usize,
    ) -> Result<usize, Violation> {
        let sentinel = self
            .rewriter
            .lock()
            .rewrite(original, obj_start, obj_end)
            .map_err(|err| Violation::internal(err.to_string()).with_index(obj_start, original))?;
        RuntimeMetrics::inc(&self.metrics.rewrites);
        Ok(sentinel)
    }

    pub(crate) fn rewritten(&self, sentinel: usize) -> Option<crate::rewrite::Rewritten> {
        self.rewriter.lock().lookup(sentinel)
    }

    pub fn try_get_original_value(&self, addr: usize) -> Result<usize, Violation> {
        if !self.sentinels.contains(addr) {
            return Ok(addr);
        }
        let original = self
            .rewriter
            .lock()
            .unrewrite(addr)
            .map_err(|err| Violation::internal(err.to_string()))?;
        RuntimeMetrics::inc(&self.metrics.unrewrites);
        Ok(original)
    }

    /// The value a rewritten pointer stands for; other values pass through.
    /// An unissued sentinel is an internal-consistency failure.
    #[track_caller]
    pub fn get_original_value(&self, addr: usize) -> usize {
        let outcome = self.try_get_original_value(addr);
        self.settle(outcome, &SourceSite::caller(), addr)
    }
}
