//! Pointer-based checking backend.
//!
//! Instead of looking objects up by address, every pointer value carries
//! `{base, bound, key, lock}` metadata. Metadata of pointers held in memory
//! lives in a trie keyed by the slot address, metadata of pointer arguments
//! travels on a shadow stack, and temporal safety comes from lock-and-key
//! pairs. The checks themselves are pure functions of that metadata.

mod checks;
pub mod shadow_stack;
pub mod temporal;
pub mod trie;

use parking_lot::Mutex;

use crate::config::SoftBoundConfig;
use crate::error::RuntimeError;
use crate::violation::{ObjectBounds, Violation, ViolationKind};

pub use checks::Access;
pub use shadow_stack::{Field, ShadowStack};
pub use temporal::{FreeMapRemoval, KeyLock, TemporalState};
pub use trie::{MetadataTrie, PointerMetadata};

/// Largest size accepted by the memcopy checks (2^48).
pub const MEMCOPY_LIMIT: usize = 1 << 48;

/// Spatial check of an access of `size` bytes at `ptr`.
pub fn spatial_check(base: usize, bound: usize, ptr: usize, size: usize) -> Result<(), Violation> {
    if ptr < base || ptr.saturating_add(size) > bound {
        return Err(Violation::new(ViolationKind::OutOfBounds, ptr)
            .with_object(ObjectBounds { start: base, end: bound })
            .with_detail(format!("access of {size} bytes")));
    }
    Ok(())
}

/// Temporal check: the lock must still hold the pointer's key. `current` is
/// the lock content, `None` when the lock is null or unknown.
pub fn temporal_check(key: usize, lock: usize, current: Option<usize>) -> Result<(), Violation> {
    match current {
        Some(value) if value == key => Ok(()),
        Some(value) => Err(Violation::new(ViolationKind::TemporalViolation, lock)
            .with_detail(format!("key mismatch: key {key:#x}, lock holds {value:#x}"))),
        None => Err(Violation::new(ViolationKind::TemporalViolation, lock)
            .with_detail("lock is null or not a runtime lock")),
    }
}

/// An indirect call must go through a pointer to the start of its function.
pub fn call_dereference_check(base: usize, bound: usize, ptr: usize) -> Result<(), Violation> {
    if base != bound && ptr != base {
        return Err(Violation::new(ViolationKind::FunctionPointerViolation, ptr)
            .with_object(ObjectBounds { start: base, end: bound }));
    }
    Ok(())
}

fn memcopy_side(ptr: usize, base: usize, bound: usize, size: usize) -> Result<(), Violation> {
    let end = ptr.checked_add(size);
    match end {
        Some(end) if ptr >= base && end >= base && end <= bound && size <= bound => Ok(()),
        _ => Err(Violation::new(ViolationKind::OutOfBounds, ptr)
            .with_object(ObjectBounds { start: base, end: bound })
            .with_detail(format!("copy of {size} bytes"))),
    }
}

/// Check both sides of a `memcpy`-style copy of `size` bytes.
pub fn memcopy_check(
    dest: (usize, usize, usize),
    src: (usize, usize, usize),
    size: usize,
) -> Result<(), Violation> {
    if size > MEMCOPY_LIMIT {
        return Err(Violation::new(ViolationKind::OutOfBounds, dest.0)
            .with_detail(format!("copy size {size:#x} exceeds limit")));
    }
    memcopy_side(dest.0, dest.1, dest.2, size)?;
    memcopy_side(src.0, src.1, src.2, size)
}

/// Intersect two bounds, as narrowing a pointer to a sub-object does.
#[must_use]
pub fn shrink_bounds(new: (usize, usize), old: (usize, usize)) -> (usize, usize) {
    (new.0.max(old.0), new.1.min(old.1))
}

/// Shared state of the backend.
pub struct SoftBound {
    pub trie: MetadataTrie,
    pub temporal: Mutex<TemporalState>,
    pub stack: Mutex<ShadowStack>,
}

impl SoftBound {
    pub fn new(config: &SoftBoundConfig) -> Result<Self, RuntimeError> {
        Ok(Self {
            trie: MetadataTrie::new(),
            temporal: Mutex::new(TemporalState::new(
                config.lock_entries,
                config.stack_lock_entries,
                config.free_map_entries,
                config.free_map_max_probe,
            )?),
            stack: Mutex::new(ShadowStack::new(config.shadow_stack_words)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spatial_check_requires_full_width() {
        assert!(spatial_check(0x1000, 0x1010, 0x1008, 8).is_ok());
        assert!(spatial_check(0x1000, 0x1010, 0x100c, 8).is_err());
        assert!(spatial_check(0x1000, 0x1010, 0xfff, 1).is_err());
    }

    #[test]
    fn temporal_check_compares_keys() {
        assert!(temporal_check(5, 0x8000, Some(5)).is_ok());
        let stale = temporal_check(5, 0x8000, Some(9)).expect_err("stale");
        assert_eq!(stale.kind, ViolationKind::TemporalViolation);
        assert!(temporal_check(5, 0, None).is_err());
    }

    #[test]
    fn call_check_allows_unbounded_or_exact() {
        assert!(call_dereference_check(0x400, 0x400, 0x999).is_ok());
        assert!(call_dereference_check(0x400, 0x401, 0x400).is_ok());
        let err = call_dereference_check(0x400, 0x401, 0x404).expect_err("mid-function");
        assert_eq!(err.kind, ViolationKind::FunctionPointerViolation);
    }

    #[test]
    fn memcopy_checks_both_sides_and_size() {
        let dest = (0x2000, 0x2000, 0x2100);
        let src = (0x3000, 0x3000, 0x3100);
        assert!(memcopy_check(dest, src, 0x100).is_ok());
        assert!(memcopy_check(dest, src, 0x101).is_err());
        assert!(memcopy_check((0x2080, 0x2000, 0x2100), src, 0x100).is_err());
        assert!(memcopy_check(dest, src, MEMCOPY_LIMIT + 1).is_err());
    }

    #[test]
    fn shrink_takes_intersection() {
        assert_eq!(shrink_bounds((0x10, 0x90), (0x20, 0x80)), (0x20, 0x80));
        assert_eq!(shrink_bounds((0x30, 0x40), (0x20, 0x80)), (0x30, 0x40));
    }

    #[test]
    fn backend_builds_from_compact_config() {
        let sb = SoftBound::new(&SoftBoundConfig::compact()).expect("tables");
        let pair = sb.temporal.lock().heap_allocation(0x1000).expect("alloc");
        let current = sb.temporal.lock().read_lock(pair.lock);
        assert!(temporal_check(pair.key, pair.lock, current).is_ok());
        sb.stack.lock().allocate(1).expect("frame");
        assert_eq!(sb.trie.load(0x1000), PointerMetadata::default());
    }
}
