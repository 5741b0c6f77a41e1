//! Pools: one allocation class with its slabs and object registries.
//!
//! A pool owns:
//! - a [`SlabAllocator`] handing out canonical nodes
//! - the live-object registry (heap, stack and externally registered objects)
//! - a registry of freed objects, keyed by the address the program saw
//! - the shadow aliases of the dangling detector, when enabled
//! - a stack of bump-allocated frames for `alloca`-style storage
//!
//! Pools perform no enforcement: misuse is returned as a [`Violation`] and the
//! runtime decides what to do with it.

#![allow(unsafe_code)]

use crate::dangling::ShadowPages;
use crate::error::RuntimeError;
use crate::platform;
use crate::provenance::{DebugMetaData, Provenance, SourceSite};
use crate::registry::{Entry, ObjectRegistry};
use crate::slab::{PoolStats, SlabAllocator, SlabFree};
use crate::violation::{ObjectBounds, Violation, ViolationKind};

/// How a live object came to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectOrigin {
    /// Allocated from the pool's slabs.
    Heap(DebugMetaData),
    /// Carved from a stack frame.
    Stack(DebugMetaData),
    /// Registered by the program (globals, stack objects it owns).
    Registered,
}

impl ObjectOrigin {
    #[must_use]
    pub fn meta(&self) -> Option<&DebugMetaData> {
        match self {
            Self::Heap(meta) | Self::Stack(meta) => Some(meta),
            Self::Registered => None,
        }
    }
}

/// Stack allocations are rounded to this many bytes.
const STACK_ALIGN: usize = 8;

struct StackFrame {
    canonical: usize,
    /// Address handed out (a shadow alias when the detector is on).
    base: usize,
    len: usize,
    cursor: usize,
    objects: Vec<usize>,
    meta: DebugMetaData,
}

impl Drop for StackFrame {
    fn drop(&mut self) {
        // SAFETY: the page was mapped by `Pool::new_stack` for this frame only.
        unsafe { platform::unmap(self.canonical, self.len) };
    }
}

pub struct Pool {
    id: u64,
    slabs: SlabAllocator,
    objects: ObjectRegistry<ObjectOrigin>,
    freed: ObjectRegistry<DebugMetaData>,
    shadows: Option<ShadowPages>,
    stacks: Vec<StackFrame>,
}

impl Pool {
    /// A pool for `node_size`-byte nodes. `shadows` enables the page-remap
    /// detector for this pool.
    #[must_use]
    pub fn new(id: u64, node_size: usize, shadows: Option<ShadowPages>) -> Self {
        Self {
            id,
            slabs: SlabAllocator::new(node_size),
            objects: ObjectRegistry::new(),
            freed: ObjectRegistry::new(),
            shadows,
            stacks: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn node_size(&self) -> usize {
        self.slabs.node_size()
    }

    /// True when `bytes` is served by a dedicated large-array mapping.
    #[must_use]
    pub fn needs_large_array(&self, bytes: usize) -> bool {
        self.slabs.nodes_for(bytes) > self.slabs.nodes_per_slab()
    }

    #[must_use]
    pub fn detects_dangling(&self) -> bool {
        self.shadows.is_some()
    }

    /// Allocate `bytes` and register the object. Returns the address the
    /// program should use.
    pub fn allocate(
        &mut self,
        bytes: usize,
        epoch: u64,
        site: SourceSite,
    ) -> Result<usize, RuntimeError> {
        let carved = self.slabs.allocate(bytes)?;
        let addr = match self.shadows.as_mut() {
            Some(shadows) => match shadows.remap(carved.canonical, bytes) {
                Ok(shadow) => shadow,
                Err(err) => {
                    return Err(match self.slabs.free(carved.canonical) {
                        SlabFree::Nodes { .. } | SlabFree::LargeArray { .. } => err,
                        SlabFree::NotOwned | SlabFree::NotAllocated => RuntimeError::Rollback {
                            addr: carved.canonical,
                            source: Box::new(err),
                        },
                    });
                }
            },
            None => carved.canonical,
        };
        self.freed.trim_overlapping(addr, bytes);
        let meta = DebugMetaData::new(epoch, site, carved.canonical);
        self.objects.insert(addr, bytes, ObjectOrigin::Heap(meta));
        Ok(addr)
    }

    /// Length of the heap object starting exactly at `addr`.
    #[must_use]
    pub fn live_len(&self, addr: usize) -> Option<usize> {
        let entry = self.objects.find(addr)?;
        (entry.base == addr && matches!(entry.tag, ObjectOrigin::Heap(_))).then_some(entry.len)
    }

    /// Free the heap object starting at `addr`.
    ///
    /// Freeing null is a no-op. Freeing an address that is not the start of a
    /// live heap object is an `InvalidFree`; freeing one that was already
    /// freed is a `DoubleFree`.
    pub fn free(
        &mut self,
        addr: usize,
        epoch: u64,
        site: SourceSite,
    ) -> Result<Option<Provenance>, Violation> {
        if addr == 0 {
            return Ok(None);
        }
        let (base, len) = match self.objects.find(addr) {
            Some(entry) if entry.base == addr && matches!(entry.tag, ObjectOrigin::Heap(_)) => {
                (entry.base, entry.len)
            }
            Some(entry) => {
                return Err(Violation::new(ViolationKind::InvalidFree, addr)
                    .with_object(ObjectBounds::new(entry.base, entry.len))
                    .with_detail("pointer is not the start of a heap object"));
            }
            None => return Err(self.misfree(addr)),
        };

        let Some(Entry {
            tag: ObjectOrigin::Heap(mut meta),
            ..
        }) = self.objects.remove(base)
        else {
            return Err(Violation::internal("registry entry vanished during free"));
        };
        meta.stamp_free(epoch, site);

        match self.slabs.free(meta.canonical) {
            SlabFree::Nodes { .. } | SlabFree::LargeArray { .. } => {}
            SlabFree::NotOwned | SlabFree::NotAllocated => {
                return Err(Violation::internal("registered object has no live slab run")
                    .with_object(ObjectBounds::new(base, len))
                    .with_provenance(&meta));
            }
        }

        let provenance = meta.provenance();
        if let Some(shadows) = self.shadows.as_mut() {
            shadows.retire(base, len, provenance).map_err(|err| {
                Violation::internal(err.to_string()).with_object(ObjectBounds::new(base, len))
            })?;
        }
        self.freed.insert(base, len, meta);
        Ok(Some(provenance))
    }

    fn misfree(&self, addr: usize) -> Violation {
        match self.freed.find(addr) {
            Some(entry) if entry.base == addr => Violation::new(ViolationKind::DoubleFree, addr)
                .with_object(ObjectBounds::new(entry.base, entry.len))
                .with_provenance(entry.tag),
            Some(entry) => Violation::new(ViolationKind::InvalidFree, addr)
                .with_object(ObjectBounds::new(entry.base, entry.len))
                .with_provenance(entry.tag)
                .with_detail("pointer is inside a freed object"),
            None => Violation::new(ViolationKind::InvalidFree, addr)
                .with_detail("pointer was not allocated from this pool"),
        }
    }

    /// Register a program-owned object. Freed records lose the bytes it covers.
    pub fn register(&mut self, addr: usize, len: usize) {
        self.freed.trim_overlapping(addr, len);
        self.objects.insert(addr, len, ObjectOrigin::Registered);
    }

    /// Drop the registration starting at `addr`. Heap and stack objects are
    /// left alone.
    pub fn unregister(&mut self, addr: usize) -> bool {
        match self.objects.find(addr) {
            Some(entry) if entry.base == addr && *entry.tag == ObjectOrigin::Registered => {
                self.objects.remove(addr);
                true
            }
            _ => false,
        }
    }

    /// Live object containing `addr`.
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<Entry<&ObjectOrigin>> {
        self.objects.find(addr)
    }

    /// Freed object containing `addr`.
    #[must_use]
    pub fn find_freed(&self, addr: usize) -> Option<Entry<&DebugMetaData>> {
        self.freed.find(addr)
    }

    /// Base and length of the live object containing `addr`.
    #[must_use]
    pub fn retrieve(&self, addr: usize) -> Option<(usize, usize)> {
        self.objects.retrieve(addr)
    }

    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn freed_objects(&self) -> usize {
        self.freed.len()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.slabs.stats()
    }

    /// Copy `len` bytes between two objects of this pool.
    ///
    /// # Safety
    ///
    /// Both ranges must lie inside live objects and must not overlap.
    pub(crate) unsafe fn copy_bytes(from: usize, to: usize, len: usize) {
        // SAFETY: guaranteed by the caller.
        unsafe { std::ptr::copy_nonoverlapping(from as *const u8, to as *mut u8, len) };
    }

    /// Zero `len` bytes at `addr`.
    ///
    /// # Safety
    ///
    /// The range must lie inside a live object.
    pub(crate) unsafe fn zero_bytes(addr: usize, len: usize) {
        // SAFETY: guaranteed by the caller.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
    }

    // -----------------------------------------------------------------------
    // Stack frames
    // -----------------------------------------------------------------------

    /// Push a fresh one-page stack frame.
    pub fn new_stack(&mut self, epoch: u64, site: SourceSite) -> Result<(), RuntimeError> {
        let len = platform::page_size();
        let canonical = platform::map_shared(len)?;
        let base = match self.shadows.as_mut() {
            Some(shadows) => match shadows.remap(canonical, len) {
                Ok(shadow) => shadow,
                Err(err) => {
                    // SAFETY: mapped just above and never handed out.
                    unsafe { platform::unmap(canonical, len) };
                    return Err(err);
                }
            },
            None => canonical,
        };
        self.stacks.push(StackFrame {
            canonical,
            base,
            len,
            cursor: 0,
            objects: Vec::new(),
            meta: DebugMetaData::new(epoch, site, canonical),
        });
        Ok(())
    }

    #[must_use]
    pub fn stack_depth(&self) -> usize {
        self.stacks.len()
    }

    /// Carve `bytes` from the top frame. `None` without a frame or when the
    /// frame is full.
    pub fn alloca(&mut self, bytes: usize, epoch: u64, site: SourceSite) -> Option<usize> {
        let frame = self.stacks.last_mut()?;
        let size = bytes.max(1).checked_next_multiple_of(STACK_ALIGN)?;
        if frame.cursor + size > frame.len {
            return None;
        }
        let addr = frame.base + frame.cursor;
        let canonical = frame.canonical + frame.cursor;
        frame.cursor += size;
        frame.objects.push(addr);
        self.freed.trim_overlapping(addr, bytes);
        self.objects.insert(
            addr,
            bytes,
            ObjectOrigin::Stack(DebugMetaData::new(epoch, site, canonical)),
        );
        Some(addr)
    }

    /// Pop the top frame, retiring every object carved from it. Returns the
    /// number of objects released.
    pub fn del_stack(&mut self, epoch: u64, site: SourceSite) -> Result<usize, Violation> {
        let Some(mut frame) = self.stacks.pop() else {
            return Err(Violation::internal("stack frame popped with no frame pushed"));
        };
        let released = frame.objects.len();
        for addr in frame.objects.drain(..) {
            if let Some(Entry {
                base,
                len,
                tag: ObjectOrigin::Stack(mut meta),
            }) = self.objects.remove(addr)
            {
                meta.stamp_free(epoch, site.clone());
                self.freed.insert(base, len, meta);
            }
        }
        frame.meta.stamp_free(epoch, site);
        if let Some(shadows) = self.shadows.as_mut() {
            shadows
                .retire(frame.base, frame.len, frame.meta.provenance())
                .map_err(|err| Violation::internal(err.to_string()))?;
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_pool(node_size: usize) -> Pool {
        Pool::new(1, node_size, None)
    }

    #[test]
    fn allocate_registers_requested_length() {
        let mut pool = plain_pool(16);
        let p = pool.allocate(40, 1, SourceSite::UNKNOWN).expect("alloc");
        assert_eq!(pool.retrieve(p + 39), Some((p, 40)));
        assert!(pool.find(p + 40).is_none());
        assert_eq!(pool.live_len(p), Some(40));
        assert_eq!(pool.live_len(p + 8), None);
    }

    #[test]
    fn free_moves_object_to_freed_registry() {
        let mut pool = plain_pool(16);
        let p = pool.allocate(16, 1, SourceSite::UNKNOWN).expect("alloc");
        let prov = pool
            .free(p, 4, SourceSite::UNKNOWN)
            .expect("free")
            .expect("provenance");
        assert_eq!(prov.alloc_epoch, 1);
        assert_eq!(prov.free_epoch, Some(4));
        assert!(pool.find(p).is_none());
        assert_eq!(pool.find_freed(p + 3).map(|e| e.base), Some(p));
        assert_eq!(pool.live_objects(), 0);
    }

    #[test]
    fn null_free_is_a_noop() {
        let mut pool = plain_pool(16);
        assert_eq!(pool.free(0, 1, SourceSite::UNKNOWN).expect("null"), None);
    }

    #[test]
    fn double_and_invalid_frees_are_classified() {
        let mut pool = plain_pool(16);
        let p = pool.allocate(32, 1, SourceSite::UNKNOWN).expect("alloc");
        let interior = pool.free(p + 8, 2, SourceSite::UNKNOWN).expect_err("interior");
        assert_eq!(interior.kind, ViolationKind::InvalidFree);

        pool.free(p, 3, SourceSite::UNKNOWN).expect("free");
        let again = pool.free(p, 4, SourceSite::UNKNOWN).expect_err("double");
        assert_eq!(again.kind, ViolationKind::DoubleFree);
        assert_eq!(again.provenance.and_then(|p| p.free_epoch), Some(3));

        let foreign = pool.free(0xdead_0000, 5, SourceSite::UNKNOWN).expect_err("foreign");
        assert_eq!(foreign.kind, ViolationKind::InvalidFree);
    }

    #[test]
    fn reallocation_evicts_stale_freed_entries() {
        let mut pool = plain_pool(64);
        let p = pool.allocate(64, 1, SourceSite::UNKNOWN).expect("alloc");
        pool.free(p, 2, SourceSite::UNKNOWN).expect("free");
        let q = pool.allocate(64, 3, SourceSite::UNKNOWN).expect("alloc");
        // Without shadow pages the canonical node is recycled.
        assert_eq!(p, q);
        assert!(pool.find_freed(q).is_none());
        assert!(pool.find(q).is_some());
    }

    #[test]
    fn partial_reuse_keeps_the_rest_of_a_freed_object() {
        let mut pool = plain_pool(16);
        // Keeps the slab alive once the run is freed.
        let _keeper = pool.allocate(16, 1, SourceSite::UNKNOWN).expect("alloc");
        let p = pool.allocate(64, 1, SourceSite::UNKNOWN).expect("alloc");
        pool.free(p, 2, SourceSite::UNKNOWN).expect("free");

        let mut reused = None;
        let attempts = pool.slabs.nodes_per_slab() as u64 * 2;
        for epoch in 3..attempts {
            let q = pool.allocate(16, epoch, SourceSite::UNKNOWN).expect("alloc");
            if (p..p + 64).contains(&q) {
                reused = Some(q);
                break;
            }
        }
        let q = reused.expect("a node of the freed run is recycled");
        assert!(pool.find_freed(q).is_none());
        for node in (p..p + 64).step_by(16).filter(|node| *node != q) {
            let entry = pool.find_freed(node).expect("untouched bytes stay freed");
            assert_eq!(entry.tag.free_epoch, Some(2));
            assert!(pool.find(node).is_none());
        }
    }

    #[test]
    fn registered_objects_cannot_be_freed() {
        let mut pool = plain_pool(8);
        let buf = [0u8; 32];
        let addr = buf.as_ptr() as usize;
        pool.register(addr, buf.len());
        let err = pool.free(addr, 1, SourceSite::UNKNOWN).expect_err("registered");
        assert_eq!(err.kind, ViolationKind::InvalidFree);
        assert!(pool.unregister(addr));
        assert!(!pool.unregister(addr));
    }

    #[test]
    fn stack_frames_bump_and_release() {
        let mut pool = plain_pool(8);
        assert!(pool.alloca(8, 1, SourceSite::UNKNOWN).is_none());
        pool.new_stack(1, SourceSite::UNKNOWN).expect("frame");
        let a = pool.alloca(3, 2, SourceSite::UNKNOWN).expect("a");
        let b = pool.alloca(8, 3, SourceSite::UNKNOWN).expect("b");
        assert_eq!(b - a, 8);
        assert_eq!(pool.retrieve(a), Some((a, 3)));
        assert!(pool.alloca(platform::page_size(), 4, SourceSite::UNKNOWN).is_none());

        assert_eq!(pool.del_stack(5, SourceSite::UNKNOWN).expect("pop"), 2);
        assert!(pool.find(a).is_none());
        assert_eq!(pool.find_freed(b).map(|e| e.tag.free_epoch), Some(Some(5)));
        assert_eq!(pool.stack_depth(), 0);
        assert!(pool.del_stack(6, SourceSite::UNKNOWN).is_err());
    }

    #[test]
    fn stats_follow_allocations() {
        let mut pool = plain_pool(32);
        let p = pool.allocate(32, 1, SourceSite::UNKNOWN).expect("alloc");
        let big = pool
            .allocate(platform::page_size() * 2, 2, SourceSite::UNKNOWN)
            .expect("large");
        let stats = pool.stats();
        assert_eq!(stats.live_nodes, 1);
        assert_eq!(stats.large_arrays, 1);
        pool.free(big, 3, SourceSite::UNKNOWN).expect("free large");
        pool.free(p, 4, SourceSite::UNKNOWN).expect("free");
        assert_eq!(pool.stats().live_nodes, 0);
        assert_eq!(pool.stats().large_arrays, 0);
    }
}
