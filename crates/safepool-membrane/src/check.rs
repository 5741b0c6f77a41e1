//! Bounds and load/store checks against pool registries.
//!
//! Index check stages for `(pool, src, dst)`:
//! 1. Source inside a live pool object: bound `dst` against it
//! 2. Source is a sentinel: recover the original pointer and its object,
//!    move `dst` by the same offset, and bound that
//! 3. Source inside the low guard page: tolerated while `dst` stays there
//! 4. Source inside a registered external object
//! 5. Nothing found: complete checks report, incomplete checks pass `dst`
//!
//! Bounding accepts `start <= dst < end`. A result outside that range is
//! turned into a sentinel when the indexing mode tolerates it and reported
//! otherwise.

use crate::exact;
use crate::metrics::RuntimeMetrics;
use crate::platform;
use crate::pool::Pool;
use crate::provenance::{Provenance, SourceSite};
use crate::runtime::Runtime;
use crate::violation::{ObjectBounds, Violation, ViolationKind};

/// Whether a check may assume every object it can meet is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// All objects are known: a miss is a violation.
    Complete,
    /// Some objects may be unregistered: a miss passes.
    Incomplete,
}

impl Runtime {
    fn bound_index(
        &self,
        start: usize,
        end: usize,
        src: usize,
        dst: usize,
        provenance: Option<Provenance>,
    ) -> Result<usize, Violation> {
        if start <= dst && dst < end {
            RuntimeMetrics::inc(&self.counters().fast_path_hits);
            return Ok(dst);
        }
        if self.config().indexing.tolerates(dst, end) {
            return self.issue_sentinel(dst, start, end);
        }
        let mut violation = Violation::new(ViolationKind::OutOfBounds, dst)
            .with_index(src, dst)
            .with_object(ObjectBounds { start, end });
        if let Some(provenance) = provenance {
            violation = violation.with_raw_provenance(provenance);
        }
        Err(violation)
    }

    fn index_check(
        &self,
        pool: &Pool,
        src: usize,
        dst: usize,
        completeness: Completeness,
    ) -> Result<usize, Violation> {
        if !self.config().mode.checks_enabled() {
            return Ok(dst);
        }
        RuntimeMetrics::inc(&self.counters().index_checks);

        // Stage 1: pool registry
        if let Some(entry) = pool.find(src) {
            let provenance = entry.tag.meta().map(|meta| meta.provenance());
            return self.bound_index(entry.base, entry.end(), src, dst, provenance);
        }

        // Stage 2: rewritten source
        if self.is_sentinel(src) {
            let Some(rewritten) = self.rewritten(src) else {
                return Err(Violation::internal("index source is an unissued sentinel")
                    .with_index(src, dst));
            };
            RuntimeMetrics::inc(&self.counters().unrewrites);
            let true_src = rewritten.original;
            let true_dst = true_src.wrapping_add(dst.wrapping_sub(src));
            return self.bound_index(rewritten.obj_start, rewritten.obj_end, true_src, true_dst, None);
        }

        // Stage 3: low guard page
        let page = platform::page_size();
        if src < page {
            if dst < page {
                return Ok(dst);
            }
            return self.bound_index(0, page, src, dst, None);
        }

        // Stage 4: external objects
        if let Some((base, len)) = self.find_external(src) {
            RuntimeMetrics::inc(&self.counters().external_hits);
            return self.bound_index(base, base.saturating_add(len), src, dst, None);
        }

        // Stage 5: unknown source
        match completeness {
            Completeness::Complete => Err(Violation::new(ViolationKind::OutOfBounds, dst)
                .with_index(src, dst)
                .with_detail("source pointer not found in pool")),
            Completeness::Incomplete => {
                RuntimeMetrics::inc(&self.counters().incomplete_passes);
                Ok(dst)
            }
        }
    }

    fn access_check(
        &self,
        pool: &Pool,
        ptr: usize,
        width: usize,
        completeness: Completeness,
    ) -> Result<(), Violation> {
        if !self.config().mode.checks_enabled() {
            return Ok(());
        }
        RuntimeMetrics::inc(&self.counters().dereference_checks);
        let width = width.max(1);

        if let Some(entry) = pool.find(ptr) {
            if ptr.saturating_add(width) <= entry.end() {
                RuntimeMetrics::inc(&self.counters().fast_path_hits);
                return Ok(());
            }
            let mut violation = Violation::new(ViolationKind::LoadStoreViolation, ptr)
                .with_object(ObjectBounds::new(entry.base, entry.len))
                .with_detail(format!("access of {width} bytes runs past the object"));
            if let Some(meta) = entry.tag.meta() {
                violation = violation.with_provenance(meta);
            }
            return Err(violation);
        }

        if let Some(entry) = pool.find_freed(ptr) {
            return Err(Violation::new(ViolationKind::DanglingPointer, ptr)
                .with_object(ObjectBounds::new(entry.base, entry.len))
                .with_provenance(entry.tag));
        }

        if self.is_sentinel(ptr) {
            let mut violation = Violation::new(ViolationKind::LoadStoreViolation, ptr)
                .with_detail("dereference of a rewritten out-of-bounds pointer");
            if let Some(rewritten) = self.rewritten(ptr) {
                violation = violation
                    .with_index(ptr, rewritten.original)
                    .with_object(ObjectBounds {
                        start: rewritten.obj_start,
                        end: rewritten.obj_end,
                    });
            }
            return Err(violation);
        }

        match completeness {
            Completeness::Complete => self
                .external_access(ptr, width)
                .unwrap_or_else(|| Err(Violation::new(ViolationKind::LoadStoreViolation, ptr))),
            Completeness::Incomplete => {
                if self.config().track_external {
                    if let Some(outcome) = self.external_access(ptr, width) {
                        return outcome;
                    }
                }
                RuntimeMetrics::inc(&self.counters().incomplete_passes);
                Ok(())
            }
        }
    }

    /// Bound an access against the external registry. `None` when `ptr` is
    /// in no external object.
    fn external_access(&self, ptr: usize, width: usize) -> Option<Result<(), Violation>> {
        let (base, len) = self.find_external(ptr)?;
        RuntimeMetrics::inc(&self.counters().external_hits);
        if ptr.saturating_add(width) <= base.saturating_add(len) {
            return Some(Ok(()));
        }
        Some(Err(Violation::new(ViolationKind::LoadStoreViolation, ptr)
            .with_object(ObjectBounds::new(base, len))
            .with_detail(format!("access of {width} bytes runs past the external object"))))
    }

    // -----------------------------------------------------------------------
    // Index checks
    // -----------------------------------------------------------------------

    /// Check that `dst`, computed from `src`, stays in `src`'s object.
    /// Returns the pointer the program should continue with (`dst`, or a
    /// sentinel standing for it).
    pub fn try_check_index(&self, pool: &Pool, src: usize, dst: usize) -> Result<usize, Violation> {
        self.index_check(pool, src, dst, Completeness::Complete)
    }

    pub fn try_check_index_incomplete(
        &self,
        pool: &Pool,
        src: usize,
        dst: usize,
    ) -> Result<usize, Violation> {
        self.index_check(pool, src, dst, Completeness::Incomplete)
    }

    #[track_caller]
    pub fn check_index(&self, pool: &Pool, src: usize, dst: usize) -> usize {
        self.check_index_at(pool, src, dst, &SourceSite::caller())
    }

    pub fn check_index_at(&self, pool: &Pool, src: usize, dst: usize, site: &SourceSite) -> usize {
        self.settle(self.try_check_index(pool, src, dst), site, dst)
    }

    #[track_caller]
    pub fn check_index_incomplete(&self, pool: &Pool, src: usize, dst: usize) -> usize {
        self.check_index_incomplete_at(pool, src, dst, &SourceSite::caller())
    }

    pub fn check_index_incomplete_at(
        &self,
        pool: &Pool,
        src: usize,
        dst: usize,
        site: &SourceSite,
    ) -> usize {
        self.settle(self.try_check_index_incomplete(pool, src, dst), site, dst)
    }

    // -----------------------------------------------------------------------
    // Load/store checks
    // -----------------------------------------------------------------------

    pub fn try_check_dereference(&self, pool: &Pool, ptr: usize) -> Result<(), Violation> {
        self.access_check(pool, ptr, 1, Completeness::Complete)
    }

    pub fn try_check_dereference_incomplete(&self, pool: &Pool, ptr: usize) -> Result<(), Violation> {
        self.access_check(pool, ptr, 1, Completeness::Incomplete)
    }

    /// Check an access of `width` bytes at `ptr`.
    pub fn try_check_access(&self, pool: &Pool, ptr: usize, width: usize) -> Result<(), Violation> {
        self.access_check(pool, ptr, width, Completeness::Complete)
    }

    #[track_caller]
    pub fn check_dereference(&self, pool: &Pool, ptr: usize) {
        self.check_dereference_at(pool, ptr, &SourceSite::caller());
    }

    pub fn check_dereference_at(&self, pool: &Pool, ptr: usize, site: &SourceSite) {
        self.settle(self.try_check_dereference(pool, ptr), site, ());
    }

    #[track_caller]
    pub fn check_dereference_incomplete(&self, pool: &Pool, ptr: usize) {
        self.check_dereference_incomplete_at(pool, ptr, &SourceSite::caller());
    }

    pub fn check_dereference_incomplete_at(&self, pool: &Pool, ptr: usize, site: &SourceSite) {
        self.settle(self.try_check_dereference_incomplete(pool, ptr), site, ());
    }

    #[track_caller]
    pub fn check_access(&self, pool: &Pool, ptr: usize, width: usize) {
        let site = SourceSite::caller();
        self.settle(self.try_check_access(pool, ptr, width), &site, ());
    }

    // -----------------------------------------------------------------------
    // Alignment
    // -----------------------------------------------------------------------

    /// `node` must sit exactly `offset` bytes into a live object. A null node
    /// with offset 0 is aligned.
    pub fn try_check_align(&self, pool: &Pool, node: usize, offset: usize) -> Result<(), Violation> {
        if !self.config().mode.checks_enabled() || (node == 0 && offset == 0) {
            return Ok(());
        }
        match pool.find(node) {
            Some(entry) if node - entry.base == offset => Ok(()),
            Some(entry) => Err(Violation::new(ViolationKind::AlignmentViolation, node)
                .with_object(ObjectBounds::new(entry.base, entry.len))
                .with_detail(format!(
                    "offset {} within object, expected {offset}",
                    node - entry.base
                ))),
            None => Err(Violation::new(ViolationKind::AlignmentViolation, node)
                .with_detail("pointer not found in pool")),
        }
    }

    #[track_caller]
    pub fn check_align(&self, pool: &Pool, node: usize, offset: usize) {
        self.check_align_at(pool, node, offset, &SourceSite::caller());
    }

    pub fn check_align_at(&self, pool: &Pool, node: usize, offset: usize, site: &SourceSite) {
        self.settle(self.try_check_align(pool, node, offset), site, ());
    }

    // -----------------------------------------------------------------------
    // Exact checks
    // -----------------------------------------------------------------------

    fn exact<T>(&self, outcome: Result<(), Violation>, ok: T) -> Result<T, Violation> {
        if !self.config().mode.checks_enabled() {
            return Ok(ok);
        }
        RuntimeMetrics::inc(&self.counters().exact_checks);
        outcome.map(|()| ok)
    }

    pub fn try_exact_check(&self, index: i64, bound: i64) -> Result<(), Violation> {
        self.exact(exact::exact_check(index, bound), ())
    }

    /// `result` must lie in `[base, base+size)`; a tolerated miss returns a
    /// sentinel like an index check would.
    pub fn try_exact_check2(&self, base: usize, result: usize, size: usize) -> Result<usize, Violation> {
        match self.exact(exact::exact_check2(base, result, size), result) {
            Err(violation) if violation.kind == ViolationKind::OutOfBounds => {
                let end = base.wrapping_add(size);
                if self.config().indexing.tolerates(result, end) {
                    self.issue_sentinel(result, base, end)
                } else {
                    Err(violation)
                }
            }
            outcome => outcome,
        }
    }

    pub fn try_exact_check2a(&self, base: usize, result: usize, size: usize) -> Result<usize, Violation> {
        self.exact(exact::exact_check2a(base, result, size), result)
    }

    pub fn try_exact_check3(&self, base: usize, result: usize, end: usize) -> Result<usize, Violation> {
        self.exact(exact::exact_check3(base, result, end), result)
    }

    pub fn exact_check_at(&self, index: i64, bound: i64, site: &SourceSite) {
        self.settle(self.try_exact_check(index, bound), site, ());
    }

    pub fn exact_check2_at(&self, base: usize, result: usize, size: usize, site: &SourceSite) -> usize {
        self.settle(self.try_exact_check2(base, result, size), site, result)
    }

    pub fn exact_check2a_at(&self, base: usize, result: usize, size: usize, site: &SourceSite) -> usize {
        self.settle(self.try_exact_check2a(base, result, size), site, result)
    }

    pub fn exact_check3_at(&self, base: usize, result: usize, end: usize, site: &SourceSite) -> usize {
        self.settle(self.try_exact_check3(base, result, end), site, result)
    }

    #[track_caller]
    pub fn exact_check(&self, index: i64, bound: i64) {
        self.exact_check_at(index, bound, &SourceSite::caller());
    }

    #[track_caller]
    pub fn exact_check2(&self, base: usize, result: usize, size: usize) -> usize {
        self.exact_check2_at(base, result, size, &SourceSite::caller())
    }

    #[track_caller]
    pub fn exact_check2a(&self, base: usize, result: usize, size: usize) -> usize {
        self.exact_check2a_at(base, result, size, &SourceSite::caller())
    }

    #[track_caller]
    pub fn exact_check3(&self, base: usize, result: usize, end: usize) -> usize {
        self.exact_check3_at(base, result, end, &SourceSite::caller())
    }

    // -----------------------------------------------------------------------
    // Indirect calls
    // -----------------------------------------------------------------------

    pub fn try_function_pointer_check(&self, target: usize, candidates: &[usize]) -> Result<(), Violation> {
        if !self.config().mode.checks_enabled() {
            return Ok(());
        }
        exact::function_pointer_check(target, candidates)
    }

    pub fn function_pointer_check_at(&self, target: usize, candidates: &[usize], site: &SourceSite) {
        self.settle(self.try_function_pointer_check(target, candidates), site, ());
    }

    #[track_caller]
    pub fn function_pointer_check(&self, target: usize, candidates: &[usize]) {
        self.function_pointer_check_at(target, candidates, &SourceSite::caller());
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{IndexingMode, RuntimeConfig};
    use crate::runtime::Runtime;
    use crate::violation::ViolationKind;

    fn runtime(indexing: IndexingMode) -> Runtime {
        Runtime::quiet(
            RuntimeConfig::diagnostic()
                .with_indexing(indexing)
                .with_dangling(false),
        )
        .expect("runtime")
    }

    #[test]
    fn in_bounds_index_passes_through() {
        let rt = runtime(IndexingMode::OnePastEnd);
        let mut pool = rt.pool_init(8);
        let p = rt.pool_alloc(&mut pool, 40).expect("alloc");
        assert_eq!(rt.try_check_index(&pool, p, p).expect("self"), p);
        assert_eq!(rt.try_check_index(&pool, p, p + 36).expect("inside"), p + 36);
        assert_eq!(rt.try_check_index(&pool, p + 36, p).expect("back"), p);
    }

    #[test]
    fn one_past_end_depends_on_mode() {
        let rt = runtime(IndexingMode::OnePastEnd);
        let mut pool = rt.pool_init(8);
        let p = rt.pool_alloc(&mut pool, 40).expect("alloc");
        let s = rt.try_check_index(&pool, p, p + 40).expect("tolerated");
        assert!(rt.is_sentinel(s));
        assert_eq!(rt.get_original_value(s), p + 40);
        let far = rt.try_check_index(&pool, p, p + 48).expect_err("beyond one-past");
        assert_eq!(far.kind, ViolationKind::OutOfBounds);

        let strict = runtime(IndexingMode::Strict);
        let mut pool = strict.pool_init(8);
        let p = strict.pool_alloc(&mut pool, 40).expect("alloc");
        assert!(strict.try_check_index(&pool, p, p + 40).is_err());

        let rewrite = runtime(IndexingMode::Rewrite);
        let mut pool = rewrite.pool_init(8);
        let p = rewrite.pool_alloc(&mut pool, 40).expect("alloc");
        let s = rewrite.try_check_index(&pool, p, p + 400).expect("rewritten");
        assert!(rewrite.is_sentinel(s));
    }

    #[test]
    fn arithmetic_on_sentinel_returns_to_object() {
        let rt = runtime(IndexingMode::OnePastEnd);
        let mut pool = rt.pool_init(8);
        let p = rt.pool_alloc(&mut pool, 40).expect("alloc");
        let s = rt.try_check_index(&pool, p, p + 40).expect("sentinel");
        // s - 4 stands for p + 36, inside the object again.
        assert_eq!(rt.try_check_index(&pool, s, s - 4).expect("back in"), p + 36);
    }

    #[test]
    fn null_page_is_tolerated_within_itself() {
        let rt = runtime(IndexingMode::Strict);
        let pool = rt.pool_init(8);
        assert_eq!(rt.try_check_index(&pool, 0, 16).expect("low page"), 16);
        assert!(rt.try_check_index(&pool, 0, 0x10_0000).is_err());
    }

    #[test]
    fn unknown_source_complete_vs_incomplete() {
        let rt = runtime(IndexingMode::OnePastEnd);
        let pool = rt.pool_init(8);
        let src = 0x7000_0000usize;
        assert!(rt.try_check_index(&pool, src, src + 8).is_err());
        assert_eq!(rt.try_check_index_incomplete(&pool, src, src + 8).expect("pass"), src + 8);
        assert!(rt.try_check_dereference(&pool, src).is_err());
        assert!(rt.try_check_dereference_incomplete(&pool, src).is_ok());
        assert_eq!(rt.metrics().incomplete_passes, 2);
    }

    #[test]
    fn external_objects_bound_incomplete_checks() {
        let mut config = RuntimeConfig::diagnostic().with_dangling(false);
        config.track_external = true;
        let rt = Runtime::quiet(config).expect("runtime");
        let pool = rt.pool_init(8);
        let buf = [0u8; 16];
        let base = buf.as_ptr() as usize;
        rt.register_external(base, buf.len());
        assert_eq!(rt.try_check_index_incomplete(&pool, base, base + 15).expect("in"), base + 15);
        assert!(rt.try_check_index_incomplete(&pool, base, base + 64).is_err());
        assert!(rt.try_check_dereference_incomplete(&pool, base + 4).is_ok());
        let err = rt.try_check_dereference_incomplete(&pool, base + 20).expect_err("unknown past end");
        assert_eq!(err.kind, ViolationKind::LoadStoreViolation);
    }

    #[test]
    fn external_objects_are_honoured_with_default_config() {
        let rt = runtime(IndexingMode::Strict);
        assert!(!rt.config().track_external);
        let pool = rt.pool_init(8);
        let buf = vec![0u8; 16];
        let base = buf.as_ptr() as usize;
        rt.register_external(base, buf.len());

        assert_eq!(rt.try_check_index(&pool, base, base + 4).expect("complete index"), base + 4);
        assert_eq!(
            rt.try_check_index_incomplete(&pool, base, base + 15).expect("incomplete index"),
            base + 15
        );
        let oob = rt.try_check_index_incomplete(&pool, base, base + 64).expect_err("past external");
        assert_eq!(oob.kind, ViolationKind::OutOfBounds);
        assert!(rt.try_check_index(&pool, base, base + 64).is_err());

        assert!(rt.try_check_dereference(&pool, base + 4).is_ok());
        assert!(rt.try_check_access(&pool, base + 8, 8).is_ok());
        let wide = rt.try_check_access(&pool, base + 12, 8).expect_err("straddles end");
        assert_eq!(wide.kind, ViolationKind::LoadStoreViolation);
        assert_eq!(rt.metrics().external_hits, 7);

        rt.unregister_external(base);
        assert!(rt.try_check_dereference(&pool, base + 4).is_err());
    }

    #[test]
    fn dereference_after_free_is_dangling() {
        let rt = runtime(IndexingMode::OnePastEnd);
        let mut pool = rt.pool_init(16);
        let p = rt.pool_alloc(&mut pool, 16).expect("alloc");
        assert!(rt.try_check_dereference(&pool, p).is_ok());
        rt.pool_free(&mut pool, p);
        let err = rt.try_check_dereference(&pool, p + 4).expect_err("dangling");
        assert_eq!(err.kind, ViolationKind::DanglingPointer);
        let prov = err.provenance.expect("provenance");
        assert!(prov.free_epoch.is_some());
    }

    #[test]
    fn wide_access_must_fit() {
        let rt = runtime(IndexingMode::OnePastEnd);
        let mut pool = rt.pool_init(16);
        let p = rt.pool_alloc(&mut pool, 16).expect("alloc");
        assert!(rt.try_check_access(&pool, p + 8, 8).is_ok());
        let err = rt.try_check_access(&pool, p + 12, 8).expect_err("straddles end");
        assert_eq!(err.kind, ViolationKind::LoadStoreViolation);
    }

    #[test]
    fn sentinel_dereference_is_a_load_store_violation() {
        let rt = runtime(IndexingMode::OnePastEnd);
        let mut pool = rt.pool_init(8);
        let p = rt.pool_alloc(&mut pool, 8).expect("alloc");
        let s = rt.try_check_index(&pool, p, p + 8).expect("sentinel");
        let err = rt.try_check_dereference_incomplete(&pool, s).expect_err("sentinel");
        assert_eq!(err.kind, ViolationKind::LoadStoreViolation);
        assert_eq!(err.result_pointer, Some(p + 8));
    }

    #[test]
    fn alignment_requires_exact_offset() {
        let rt = runtime(IndexingMode::OnePastEnd);
        let mut pool = rt.pool_init(32);
        let p = rt.pool_alloc(&mut pool, 32).expect("alloc");
        assert!(rt.try_check_align(&pool, 0, 0).is_ok());
        assert!(rt.try_check_align(&pool, p + 8, 8).is_ok());
        let err = rt.try_check_align(&pool, p + 8, 4).expect_err("misaligned");
        assert_eq!(err.kind, ViolationKind::AlignmentViolation);
        assert!(rt.try_check_align(&pool, 0x10, 0).is_err());
    }

    #[test]
    fn exact_check2_uses_the_indexing_policy() {
        let rt = runtime(IndexingMode::OnePastEnd);
        assert_eq!(rt.try_exact_check2(0x1000, 0x1010, 0x20).expect("in"), 0x1010);
        let s = rt.try_exact_check2(0x1000, 0x1020, 0x20).expect("one past");
        assert!(rt.is_sentinel(s));
        assert!(rt.try_exact_check2(0x1000, 0x1021, 0x20).is_err());
        assert!(rt.try_exact_check(5, 5).is_err());
        assert_eq!(rt.metrics().exact_checks, 4);
    }

    #[test]
    fn diagnostic_enforcement_records_site() {
        let rt = runtime(IndexingMode::Strict);
        rt.function_pointer_check(0x44, &[0x40]);
        let reported = rt.drain_violations();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].kind, ViolationKind::FunctionPointerViolation);
        assert!(reported[0].source_line.is_some());
    }
}
