//! Atomic counters for runtime observability.
//!
//! All counters use relaxed ordering: they are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::violation::ViolationKind;

/// Operation counters of one runtime.
pub struct RuntimeMetrics {
    /// Index checks (complete and incomplete).
    pub index_checks: AtomicU64,
    /// Dereference checks (complete and incomplete).
    pub dereference_checks: AtomicU64,
    /// Checks accepted by the pool registry lookup.
    pub fast_path_hits: AtomicU64,
    /// Checks accepted through the external registry.
    pub external_hits: AtomicU64,
    /// Incomplete checks that found nothing and passed the pointer through.
    pub incomplete_passes: AtomicU64,
    /// Sentinels issued.
    pub rewrites: AtomicU64,
    /// Sentinels resolved back to their original value.
    pub unrewrites: AtomicU64,
    pub exact_checks: AtomicU64,
    /// Checked string and memory library calls.
    pub library_checks: AtomicU64,
    /// Library calls shortened to fit their operands.
    pub clamps: AtomicU64,
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    pub registrations: AtomicU64,
    pub shadow_remaps: AtomicU64,
    pub large_arrays: AtomicU64,
    /// Dangling accesses caught by the fault handler.
    pub traps: AtomicU64,
    /// Violations reported, by kind (indexed like `ViolationKind::ALL`).
    pub violations: [AtomicU64; ViolationKind::ALL.len()],
    pub metadata_loads: AtomicU64,
    pub metadata_stores: AtomicU64,
    pub metadata_memcopies: AtomicU64,
    pub spatial_checks: AtomicU64,
    pub temporal_checks: AtomicU64,
    pub heap_key_allocations: AtomicU64,
    pub stack_key_allocations: AtomicU64,
    pub heap_key_deallocations: AtomicU64,
    pub stack_key_deallocations: AtomicU64,
}

impl RuntimeMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            index_checks: AtomicU64::new(0),
            dereference_checks: AtomicU64::new(0),
            fast_path_hits: AtomicU64::new(0),
            external_hits: AtomicU64::new(0),
            incomplete_passes: AtomicU64::new(0),
            rewrites: AtomicU64::new(0),
            unrewrites: AtomicU64::new(0),
            exact_checks: AtomicU64::new(0),
            library_checks: AtomicU64::new(0),
            clamps: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            shadow_remaps: AtomicU64::new(0),
            large_arrays: AtomicU64::new(0),
            traps: AtomicU64::new(0),
            violations: [const { AtomicU64::new(0) }; ViolationKind::ALL.len()],
            metadata_loads: AtomicU64::new(0),
            metadata_stores: AtomicU64::new(0),
            metadata_memcopies: AtomicU64::new(0),
            spatial_checks: AtomicU64::new(0),
            temporal_checks: AtomicU64::new(0),
            heap_key_allocations: AtomicU64::new(0),
            stack_key_allocations: AtomicU64::new(0),
            heap_key_deallocations: AtomicU64::new(0),
            stack_key_deallocations: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn record_violation(&self, kind: ViolationKind) {
        Self::inc(&self.violations[kind_index(kind)]);
    }

    #[must_use]
    pub fn violations_of(&self, kind: ViolationKind) -> u64 {
        Self::get(&self.violations[kind_index(kind)])
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            index_checks: Self::get(&self.index_checks),
            dereference_checks: Self::get(&self.dereference_checks),
            fast_path_hits: Self::get(&self.fast_path_hits),
            external_hits: Self::get(&self.external_hits),
            incomplete_passes: Self::get(&self.incomplete_passes),
            rewrites: Self::get(&self.rewrites),
            unrewrites: Self::get(&self.unrewrites),
            exact_checks: Self::get(&self.exact_checks),
            library_checks: Self::get(&self.library_checks),
            clamps: Self::get(&self.clamps),
            allocations: Self::get(&self.allocations),
            frees: Self::get(&self.frees),
            registrations: Self::get(&self.registrations),
            shadow_remaps: Self::get(&self.shadow_remaps),
            large_arrays: Self::get(&self.large_arrays),
            traps: Self::get(&self.traps),
            violations: self.violations.each_ref().map(Self::get),
            metadata_loads: Self::get(&self.metadata_loads),
            metadata_stores: Self::get(&self.metadata_stores),
            metadata_memcopies: Self::get(&self.metadata_memcopies),
            spatial_checks: Self::get(&self.spatial_checks),
            temporal_checks: Self::get(&self.temporal_checks),
            heap_key_allocations: Self::get(&self.heap_key_allocations),
            stack_key_allocations: Self::get(&self.stack_key_allocations),
            heap_key_deallocations: Self::get(&self.heap_key_deallocations),
            stack_key_deallocations: Self::get(&self.stack_key_deallocations),
        }
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_index(kind: ViolationKind) -> usize {
    ViolationKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(ViolationKind::ALL.len() - 1)
}

/// Point-in-time snapshot of all runtime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub index_checks: u64,
    pub dereference_checks: u64,
    pub fast_path_hits: u64,
    pub external_hits: u64,
    pub incomplete_passes: u64,
    pub rewrites: u64,
    pub unrewrites: u64,
    pub exact_checks: u64,
    pub library_checks: u64,
    pub clamps: u64,
    pub allocations: u64,
    pub frees: u64,
    pub registrations: u64,
    pub shadow_remaps: u64,
    pub large_arrays: u64,
    pub traps: u64,
    pub violations: [u64; ViolationKind::ALL.len()],
    pub metadata_loads: u64,
    pub metadata_stores: u64,
    pub metadata_memcopies: u64,
    pub spatial_checks: u64,
    pub temporal_checks: u64,
    pub heap_key_allocations: u64,
    pub stack_key_allocations: u64,
    pub heap_key_deallocations: u64,
    pub stack_key_deallocations: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn violations_of(&self, kind: ViolationKind) -> u64 {
        self.violations[kind_index(kind)]
    }

    #[must_use]
    pub fn total_violations(&self) -> u64 {
        self.violations.iter().sum()
    }
}
