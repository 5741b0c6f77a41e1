//! Runtime entry points of the pointer-based backend.
//!
//! Metadata bookkeeping (trie, shadow stack, key/lock minting) runs in every
//! mode; the checks are skipped when enforcement is off. Table exhaustion and
//! shadow-stack misuse are engine failures and surface as
//! internal-consistency violations through the enforcing variants.

use crate::error::RuntimeError;
use crate::metrics::RuntimeMetrics;
use crate::provenance::SourceSite;
use crate::runtime::Runtime;
use crate::softbound::temporal::GLOBAL_KEY;
use crate::softbound::{self, Field, FreeMapRemoval, KeyLock, PointerMetadata};
use crate::violation::{Violation, ViolationKind};

/// Which side of an access a spatial or temporal check guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Load,
    Store,
}

impl Access {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Store => "store",
        }
    }
}

fn engine_failure(err: &RuntimeError) -> Violation {
    Violation::internal(err.to_string())
}

impl Runtime {
    // -----------------------------------------------------------------------
    // Metadata trie
    // -----------------------------------------------------------------------

    /// Record the metadata of the pointer held at `slot`.
    pub fn try_metadata_store(&self, slot: usize, meta: PointerMetadata) -> Result<(), RuntimeError> {
        RuntimeMetrics::inc(&self.counters().metadata_stores);
        self.softbound().trie.store(slot, meta)
    }

    #[track_caller]
    pub fn metadata_store(&self, slot: usize, meta: PointerMetadata) {
        let outcome = self.try_metadata_store(slot, meta).map_err(|err| engine_failure(&err));
        self.settle(outcome, &SourceSite::caller(), ());
    }

    /// Metadata of the pointer held at `slot`; all zero if never stored.
    #[must_use]
    pub fn metadata_load(&self, slot: usize) -> PointerMetadata {
        RuntimeMetrics::inc(&self.counters().metadata_loads);
        self.softbound().trie.load(slot)
    }

    /// Duplicate the metadata of every pointer slot in `[from, from+size)`
    /// onto `[dest, dest+size)`, as an instrumented `memcpy` must.
    pub fn try_copy_metadata(&self, dest: usize, from: usize, size: usize) -> Result<(), RuntimeError> {
        RuntimeMetrics::inc(&self.counters().metadata_memcopies);
        self.softbound().trie.copy_metadata(dest, from, size)
    }

    #[track_caller]
    pub fn copy_metadata(&self, dest: usize, from: usize, size: usize) {
        let outcome = self
            .try_copy_metadata(dest, from, size)
            .map_err(|err| engine_failure(&err));
        self.settle(outcome, &SourceSite::caller(), ());
    }

    // -----------------------------------------------------------------------
    // Spatial and temporal checks
    // -----------------------------------------------------------------------

    pub fn try_spatial_check(
        &self,
        access: Access,
        base: usize,
        bound: usize,
        ptr: usize,
        size: usize,
    ) -> Result<(), Violation> {
        if !self.config().mode.checks_enabled() {
            return Ok(());
        }
        RuntimeMetrics::inc(&self.counters().spatial_checks);
        softbound::spatial_check(base, bound, ptr, size)
            .map_err(|v| v.with_detail(format!("{} of {size} bytes", access.as_str())))
    }

    pub fn spatial_check_at(
        &self,
        access: Access,
        base: usize,
        bound: usize,
        ptr: usize,
        size: usize,
        site: &SourceSite,
    ) {
        self.settle(self.try_spatial_check(access, base, bound, ptr, size), site, ());
    }

    #[track_caller]
    pub fn spatial_load_check(&self, base: usize, bound: usize, ptr: usize, size: usize) {
        self.spatial_check_at(Access::Load, base, bound, ptr, size, &SourceSite::caller());
    }

    #[track_caller]
    pub fn spatial_store_check(&self, base: usize, bound: usize, ptr: usize, size: usize) {
        self.spatial_check_at(Access::Store, base, bound, ptr, size, &SourceSite::caller());
    }

    /// The lock at `lock` must still hold `key`. Only lock cells minted by
    /// this runtime are read; any other address fails the check.
    pub fn try_temporal_check(&self, access: Access, key: usize, lock: usize) -> Result<(), Violation> {
        if !self.config().mode.checks_enabled() {
            return Ok(());
        }
        RuntimeMetrics::inc(&self.counters().temporal_checks);
        let current = self.softbound().temporal.lock().read_lock(lock);
        softbound::temporal_check(key, lock, current).map_err(|v| {
            let detail = v.detail.clone().unwrap_or_default();
            v.with_detail(format!("{}: {detail}", access.as_str()))
        })
    }

    pub fn temporal_check_at(&self, access: Access, key: usize, lock: usize, site: &SourceSite) {
        self.settle(self.try_temporal_check(access, key, lock), site, ());
    }

    #[track_caller]
    pub fn temporal_load_check(&self, key: usize, lock: usize) {
        self.temporal_check_at(Access::Load, key, lock, &SourceSite::caller());
    }

    #[track_caller]
    pub fn temporal_store_check(&self, key: usize, lock: usize) {
        self.temporal_check_at(Access::Store, key, lock, &SourceSite::caller());
    }

    pub fn try_call_dereference_check(&self, base: usize, bound: usize, ptr: usize) -> Result<(), Violation> {
        if !self.config().mode.checks_enabled() {
            return Ok(());
        }
        softbound::call_dereference_check(base, bound, ptr)
    }

    pub fn call_dereference_check_at(&self, base: usize, bound: usize, ptr: usize, site: &SourceSite) {
        self.settle(self.try_call_dereference_check(base, bound, ptr), site, ());
    }

    #[track_caller]
    pub fn call_dereference_check(&self, base: usize, bound: usize, ptr: usize) {
        self.call_dereference_check_at(base, bound, ptr, &SourceSite::caller());
    }

    /// Both sides of a copy of `size` bytes, each as `(ptr, base, bound)`.
    pub fn try_memcopy_check(
        &self,
        dest: (usize, usize, usize),
        src: (usize, usize, usize),
        size: usize,
    ) -> Result<(), Violation> {
        if !self.config().mode.checks_enabled() {
            return Ok(());
        }
        RuntimeMetrics::inc(&self.counters().spatial_checks);
        softbound::memcopy_check(dest, src, size)
    }

    pub fn memcopy_check_at(
        &self,
        dest: (usize, usize, usize),
        src: (usize, usize, usize),
        size: usize,
        site: &SourceSite,
    ) {
        self.settle(self.try_memcopy_check(dest, src, size), site, ());
    }

    #[track_caller]
    pub fn memcopy_check(&self, dest: (usize, usize, usize), src: (usize, usize, usize), size: usize) {
        self.memcopy_check_at(dest, src, size, &SourceSite::caller());
    }

    // -----------------------------------------------------------------------
    // Shadow stack
    // -----------------------------------------------------------------------

    pub fn try_shadow_stack_allocate(&self, args: usize) -> Result<(), RuntimeError> {
        self.softbound().stack.lock().allocate(args)
    }

    pub fn try_shadow_stack_deallocate(&self) -> Result<(), RuntimeError> {
        self.softbound().stack.lock().deallocate()
    }

    pub fn try_shadow_stack_store(&self, arg: usize, field: Field, value: usize) -> Result<(), RuntimeError> {
        self.softbound().stack.lock().store(arg, field, value)
    }

    pub fn try_shadow_stack_load(&self, arg: usize, field: Field) -> Result<usize, RuntimeError> {
        self.softbound().stack.lock().load(arg, field)
    }

    /// Push a frame for `args` pointer arguments.
    #[track_caller]
    pub fn shadow_stack_allocate(&self, args: usize) {
        let outcome = self.try_shadow_stack_allocate(args).map_err(|err| engine_failure(&err));
        self.settle(outcome, &SourceSite::caller(), ());
    }

    #[track_caller]
    pub fn shadow_stack_deallocate(&self) {
        let outcome = self.try_shadow_stack_deallocate().map_err(|err| engine_failure(&err));
        self.settle(outcome, &SourceSite::caller(), ());
    }

    #[track_caller]
    pub fn shadow_stack_store(&self, arg: usize, field: Field, value: usize) {
        let outcome = self
            .try_shadow_stack_store(arg, field, value)
            .map_err(|err| engine_failure(&err));
        self.settle(outcome, &SourceSite::caller(), ());
    }

    #[track_caller]
    pub fn shadow_stack_load(&self, arg: usize, field: Field) -> usize {
        let outcome = self.try_shadow_stack_load(arg, field).map_err(|err| engine_failure(&err));
        self.settle(outcome, &SourceSite::caller(), 0)
    }

    pub fn shadow_stack_store_metadata(&self, arg: usize, meta: PointerMetadata) -> Result<(), RuntimeError> {
        self.softbound().stack.lock().store_metadata(arg, meta)
    }

    pub fn shadow_stack_load_metadata(&self, arg: usize) -> Result<PointerMetadata, RuntimeError> {
        self.softbound().stack.lock().load_metadata(arg)
    }

    #[must_use]
    pub fn shadow_stack_depth(&self) -> usize {
        self.softbound().stack.lock().depth()
    }

    // -----------------------------------------------------------------------
    // Keys and locks
    // -----------------------------------------------------------------------

    /// Lock that always holds the global key, for globals and constants.
    #[must_use]
    pub fn global_lock(&self) -> usize {
        self.softbound().temporal.lock().global_lock()
    }

    fn global_pair(&self) -> KeyLock {
        KeyLock {
            key: GLOBAL_KEY,
            lock: self.global_lock(),
        }
    }

    pub fn try_stack_memory_allocation(&self) -> Result<KeyLock, RuntimeError> {
        let pair = self.softbound().temporal.lock().stack_allocation()?;
        RuntimeMetrics::inc(&self.counters().stack_key_allocations);
        Ok(pair)
    }

    /// Mint a key and lock for a new stack frame.
    #[track_caller]
    pub fn stack_memory_allocation(&self) -> KeyLock {
        let outcome = self.try_stack_memory_allocation().map_err(|err| engine_failure(&err));
        let fallback = self.global_pair();
        self.settle(outcome, &SourceSite::caller(), fallback)
    }

    pub fn try_stack_memory_deallocation(&self) -> Result<(), RuntimeError> {
        self.softbound().temporal.lock().stack_deallocation()?;
        RuntimeMetrics::inc(&self.counters().stack_key_deallocations);
        Ok(())
    }

    #[track_caller]
    pub fn stack_memory_deallocation(&self) {
        let outcome = self.try_stack_memory_deallocation().map_err(|err| engine_failure(&err));
        self.settle(outcome, &SourceSite::caller(), ());
    }

    pub fn try_heap_memory_allocation(&self, ptr: usize) -> Result<KeyLock, RuntimeError> {
        let pair = self.softbound().temporal.lock().heap_allocation(ptr)?;
        RuntimeMetrics::inc(&self.counters().heap_key_allocations);
        Ok(pair)
    }

    /// Mint a key and lock for heap object `ptr`.
    #[track_caller]
    pub fn heap_memory_allocation(&self, ptr: usize) -> KeyLock {
        let outcome = self.try_heap_memory_allocation(ptr).map_err(|err| engine_failure(&err));
        let fallback = self.global_pair();
        self.settle(outcome, &SourceSite::caller(), fallback)
    }

    /// Retire the lock of heap object `ptr`. A pointer whose key and lock do
    /// not name a live allocation is an invalid free.
    pub fn try_memory_deallocation(&self, ptr: usize, key: usize, lock: usize) -> Result<(), Violation> {
        let removal = self.softbound().temporal.lock().heap_deallocation(ptr, key, lock);
        match removal {
            FreeMapRemoval::Removed => {
                RuntimeMetrics::inc(&self.counters().heap_key_deallocations);
                Ok(())
            }
            FreeMapRemoval::Missing => Err(Violation::new(ViolationKind::InvalidFree, ptr)
                .with_detail(format!("no live allocation for key {key:#x} at lock {lock:#x}"))),
        }
    }

    pub fn memory_deallocation_at(&self, ptr: usize, key: usize, lock: usize, site: &SourceSite) {
        self.settle(self.try_memory_deallocation(ptr, key, lock), site, ());
    }

    #[track_caller]
    pub fn memory_deallocation(&self, ptr: usize, key: usize, lock: usize) {
        self.memory_deallocation_at(ptr, key, lock, &SourceSite::caller());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnforcementMode, RuntimeConfig};

    fn runtime() -> Runtime {
        Runtime::quiet(RuntimeConfig::diagnostic().with_dangling(false)).expect("runtime")
    }

    #[test]
    fn metadata_round_trips_through_the_runtime() {
        let rt = runtime();
        let slot = 0x7f00_1000_0040;
        let meta = PointerMetadata {
            base: 0x5000,
            bound: 0x5040,
            key: 7,
            lock: 0x9000,
        };
        rt.metadata_store(slot, meta);
        assert_eq!(rt.metadata_load(slot), meta);
        assert_eq!(rt.metadata_load(slot + 8), PointerMetadata::default());
        let snap = rt.metrics();
        assert_eq!(snap.metadata_stores, 1);
        assert_eq!(snap.metadata_loads, 2);
    }

    #[test]
    fn spatial_violation_names_the_access() {
        let rt = runtime();
        rt.spatial_load_check(0x1000, 0x1010, 0x1008, 8);
        rt.spatial_store_check(0x1000, 0x1010, 0x100c, 8);
        let reported = rt.drain_violations();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].kind, ViolationKind::OutOfBounds);
        assert_eq!(reported[0].detail.as_deref(), Some("store of 8 bytes"));
        assert_eq!(rt.metrics().spatial_checks, 2);
    }

    #[test]
    fn reused_lock_rejects_stale_key() {
        let rt = runtime();
        let first = rt.heap_memory_allocation(0x4000);
        rt.temporal_load_check(first.key, first.lock);
        rt.memory_deallocation(0x4000, first.key, first.lock);

        let second = rt.heap_memory_allocation(0x4000);
        assert_eq!(second.lock, first.lock);
        assert_ne!(second.key, first.key);
        assert!(rt.try_temporal_check(Access::Load, second.key, second.lock).is_ok());
        let stale = rt
            .try_temporal_check(Access::Store, first.key, first.lock)
            .expect_err("stale key");
        assert_eq!(stale.kind, ViolationKind::TemporalViolation);
        assert!(stale.detail.as_deref().is_some_and(|d| d.starts_with("store:")));
    }

    #[test]
    fn foreign_lock_fails_temporal_check() {
        let rt = runtime();
        let local = 0usize;
        let addr = std::ptr::addr_of!(local) as usize;
        assert!(rt.try_temporal_check(Access::Load, 0, addr).is_err());
        assert!(rt.try_temporal_check(Access::Load, 2, 0).is_err());
    }

    #[test]
    fn global_lock_accepts_global_key() {
        let rt = runtime();
        rt.temporal_load_check(GLOBAL_KEY, rt.global_lock());
        assert!(rt.violations().is_empty());
    }

    #[test]
    fn deallocating_twice_is_an_invalid_free() {
        let rt = runtime();
        let pair = rt.heap_memory_allocation(0x6000);
        rt.memory_deallocation(0x6000, pair.key, pair.lock);
        rt.memory_deallocation(0x6000, pair.key, pair.lock);
        let reported = rt.drain_violations();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].kind, ViolationKind::InvalidFree);
        let snap = rt.metrics();
        assert_eq!(snap.heap_key_allocations, 1);
        assert_eq!(snap.heap_key_deallocations, 1);
    }

    #[test]
    fn stack_keys_follow_frames() {
        let rt = runtime();
        let outer = rt.stack_memory_allocation();
        let inner = rt.stack_memory_allocation();
        assert_ne!(outer.lock, inner.lock);
        rt.stack_memory_deallocation();
        assert!(rt.try_temporal_check(Access::Load, inner.key, inner.lock).is_err());
        assert!(rt.try_temporal_check(Access::Load, outer.key, outer.lock).is_ok());
        rt.stack_memory_deallocation();
        assert!(rt.try_stack_memory_deallocation().is_err());
    }

    #[test]
    fn shadow_stack_passes_arguments() {
        let rt = runtime();
        rt.shadow_stack_allocate(2);
        rt.shadow_stack_store(1, Field::Bound, 0x2040);
        rt.shadow_stack_store(0, Field::Base, 0x1000);
        assert_eq!(rt.shadow_stack_load(1, Field::Bound), 0x2040);
        assert_eq!(rt.shadow_stack_load(0, Field::Base), 0x1000);
        assert!(rt.try_shadow_stack_load(2, Field::Key).is_err());
        assert_eq!(rt.shadow_stack_depth(), 1);
        rt.shadow_stack_deallocate();
        assert_eq!(rt.shadow_stack_depth(), 0);
    }

    #[test]
    fn copy_metadata_moves_slots() {
        let rt = runtime();
        let meta = PointerMetadata {
            base: 1,
            bound: 2,
            key: 3,
            lock: 4,
        };
        rt.metadata_store(0x10_0000, meta);
        rt.copy_metadata(0x20_0000, 0x10_0000, 16);
        assert_eq!(rt.metadata_load(0x20_0000), meta);
        assert_eq!(rt.metrics().metadata_memcopies, 1);
    }

    #[test]
    fn checks_are_skipped_when_off() {
        let mut config = RuntimeConfig::diagnostic().with_dangling(false);
        config.mode = EnforcementMode::Off;
        let rt = Runtime::quiet(config).expect("runtime");
        rt.spatial_load_check(0x1000, 0x1010, 0x2000, 8);
        rt.temporal_load_check(5, 0);
        rt.call_dereference_check(0x400, 0x500, 0x404);
        rt.memcopy_check((0, 0, 0), (0, 0, 0), 1);
        assert!(rt.violations().is_empty());
        assert_eq!(rt.metrics().spatial_checks, 0);
    }

    #[test]
    fn call_and_copy_checks_report() {
        let rt = runtime();
        rt.call_dereference_check(0x400, 0x500, 0x404);
        rt.memcopy_check((0x2000, 0x2000, 0x2010), (0x3000, 0x3000, 0x3100), 0x20);
        let kinds: Vec<_> = rt.drain_violations().into_iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![ViolationKind::FunctionPointerViolation, ViolationKind::OutOfBounds]
        );
    }
}
