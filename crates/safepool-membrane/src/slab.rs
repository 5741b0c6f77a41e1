//! Page-sized slab allocator for one allocation class.
//!
//! A slab is one OS page cut into `page / node_size` nodes. Slabs live in an
//! arena and are threaded onto three index-linked lists: partially full,
//! full, and large arrays. A large array is a dedicated multi-page mapping
//! holding exactly one allocation; it never carries a bitmap and is never
//! reused for another request.
//!
//! Per-slab cursors keep the hot path short:
//! - `first_unused`: lowest free node (or `nodes` when full)
//! - `used_begin`: lower bound of the first allocated node
//! - `used_end`: one past the highest allocated node
//!
//! Invariant: `first_unused <= used_end <= nodes`.

#![allow(unsafe_code)]

use std::collections::BTreeMap;

use serde::Serialize;

use crate::bitmap::NodeBitmap;
use crate::error::RuntimeError;
use crate::platform;

pub type SlabId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Partial,
    Full,
    Large,
    Vacant,
}

struct Slab {
    base: usize,
    bytes: usize,
    bitmap: NodeBitmap,
    first_unused: usize,
    used_begin: usize,
    used_end: usize,
    allocated: usize,
    list: ListKind,
    prev: Option<SlabId>,
    next: Option<SlabId>,
}

/// Outcome of freeing a run inside one slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFree {
    Freed { nodes: usize },
    NotAllocated,
    NotStart,
}

/// A successful allocation, in canonical addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Carved {
    pub canonical: usize,
    pub slab: SlabId,
    pub first_node: usize,
    pub nodes: usize,
    pub large: bool,
}

/// Outcome of [`SlabAllocator::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabFree {
    /// Nodes were returned to their slab.
    Nodes { slab: SlabId, nodes: usize },
    /// A large array was unmapped.
    LargeArray { bytes: usize },
    /// The address does not belong to any slab of this allocator.
    NotOwned,
    /// The address is inside a slab but is not the start of a live run.
    NotAllocated,
}

/// Occupancy summary of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub node_size: usize,
    pub nodes_per_slab: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub large_arrays: usize,
    pub live_nodes: usize,
    pub capacity_nodes: usize,
    pub large_array_bytes: usize,
}

impl PoolStats {
    /// Fraction of slab capacity not holding live nodes.
    #[must_use]
    pub fn fragmentation(&self) -> f64 {
        if self.capacity_nodes == 0 {
            0.0
        } else {
            1.0 - self.live_nodes as f64 / self.capacity_nodes as f64
        }
    }
}

impl Slab {
    fn nodes(&self) -> usize {
        self.bitmap.nodes()
    }

    fn is_large(&self) -> bool {
        self.list == ListKind::Large
    }

    fn is_full(&self) -> bool {
        self.is_large() || self.first_unused == self.nodes()
    }

    fn is_empty(&self) -> bool {
        self.used_end == 0
    }

    fn assert_okay(&self) {
        debug_assert!(self.first_unused <= self.used_end);
        debug_assert!(self.used_end == self.nodes() || !self.bitmap.is_allocated(self.used_end));
        debug_assert!(
            self.first_unused == self.nodes() || !self.bitmap.is_allocated(self.first_unused)
        );
    }

    fn allocate_single(&mut self) -> Option<usize> {
        if self.is_large() {
            return None;
        }
        let size = self.nodes();

        if self.used_end < size {
            let ue = self.used_end;
            self.bitmap.mark_run(ue, 1);
            if self.first_unused == ue {
                self.first_unused += 1;
            }
            if self.used_begin > ue {
                self.used_begin = ue;
            }
            self.used_end += 1;
            self.allocated += 1;
            self.assert_okay();
            return Some(ue);
        }

        if self.first_unused < size {
            let idx = self.first_unused;
            self.bitmap.mark_run(idx, 1);
            let mut fu = idx;
            loop {
                fu += 1;
                if fu == size || !self.bitmap.is_allocated(fu) {
                    break;
                }
            }
            self.first_unused = fu;
            if self.used_begin > idx {
                self.used_begin = idx;
            }
            self.allocated += 1;
            self.assert_okay();
            return Some(idx);
        }

        None
    }

    fn allocate_multiple(&mut self, count: usize) -> Option<usize> {
        if self.is_large() {
            return None;
        }
        let size = self.nodes();

        if self.used_end + count <= size {
            let ue = self.used_end;
            self.bitmap.mark_run(ue, count);
            if self.first_unused == ue {
                self.first_unused += count;
            }
            if self.used_begin > ue {
                self.used_begin = ue;
            }
            self.used_end += count;
            self.allocated += count;
            self.assert_okay();
            return Some(ue);
        }

        let mut idx = self.first_unused;
        while idx + count <= size {
            debug_assert!(!self.bitmap.is_allocated(idx), "first_unused is stale");

            let mut last_unused = idx + 1;
            while last_unused != idx + count && !self.bitmap.is_allocated(last_unused) {
                last_unused += 1;
            }

            if last_unused == idx + count {
                self.bitmap.mark_run(idx, count);
                if idx == self.first_unused {
                    let mut i = self.first_unused + count;
                    while i < self.used_end && self.bitmap.is_allocated(i) {
                        i += 1;
                    }
                    self.first_unused = if self.bitmap.is_allocated(i) { size } else { i };
                }
                if self.used_begin > idx {
                    self.used_begin = idx;
                }
                self.allocated += count;
                self.assert_okay();
                return Some(idx);
            }

            idx = last_unused;
            while idx + count <= size && self.bitmap.is_allocated(idx) {
                idx += 1;
            }
        }

        None
    }

    fn free_run(&mut self, idx: usize) -> RunFree {
        if !self.bitmap.is_allocated(idx) {
            return RunFree::NotAllocated;
        }
        if !self.bitmap.is_start(idx) {
            return RunFree::NotStart;
        }

        self.bitmap.clear_start(idx);
        self.bitmap.mark_free(idx);
        self.allocated -= 1;

        let ue = self.used_end;
        let mut end = idx + 1;
        while end != ue && !self.bitmap.is_start(end) && self.bitmap.is_allocated(end) {
            self.bitmap.mark_free(end);
            self.allocated -= 1;
            end += 1;
        }

        if idx < self.first_unused {
            self.first_unused = idx;
        }
        if idx == self.used_begin {
            self.used_begin = end;
        }

        if end == ue {
            if self.used_begin == ue {
                self.first_unused = 0;
                self.used_begin = 0;
                self.used_end = 0;
            } else if self.first_unused == idx {
                self.used_end = idx;
            } else {
                self.used_end = self.bitmap.last_allocated_through(idx);
                if self.first_unused > self.used_end {
                    self.first_unused = self.used_end;
                }
            }
        }
        self.assert_okay();
        RunFree::Freed { nodes: end - idx }
    }
}

/// The slab allocator of one pool.
pub struct SlabAllocator {
    node_size: usize,
    nodes_per_slab: usize,
    slabs: Vec<Slab>,
    vacant: Vec<SlabId>,
    partial: Option<SlabId>,
    full: Option<SlabId>,
    large: Option<SlabId>,
    by_base: BTreeMap<usize, SlabId>,
}

impl SlabAllocator {
    /// Allocator for `node_size`-byte nodes (0 is treated as 1).
    #[must_use]
    pub fn new(node_size: usize) -> Self {
        let node_size = node_size.max(1);
        Self {
            node_size,
            nodes_per_slab: platform::page_size() / node_size,
            slabs: Vec::new(),
            vacant: Vec::new(),
            partial: None,
            full: None,
            large: None,
            by_base: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    #[must_use]
    pub fn nodes_per_slab(&self) -> usize {
        self.nodes_per_slab
    }

    /// Nodes needed for `bytes` (at least one).
    #[must_use]
    pub fn nodes_for(&self, bytes: usize) -> usize {
        bytes.max(1).div_ceil(self.node_size)
    }

    /// Allocate room for `bytes` bytes.
    pub fn allocate(&mut self, bytes: usize) -> Result<Carved, RuntimeError> {
        let nodes = self.nodes_for(bytes);
        if nodes > self.nodes_per_slab {
            return self.allocate_large(bytes.max(1));
        }
        if nodes == 1 {
            self.allocate_single()
        } else {
            self.allocate_run(nodes)
        }
    }

    /// Allocate one node.
    pub fn allocate_single(&mut self) -> Result<Carved, RuntimeError> {
        let mut cursor = self.partial;
        while let Some(id) = cursor {
            if let Some(node) = self.slabs[id].allocate_single() {
                return Ok(self.carved(id, node, 1));
            }
            cursor = self.slabs[id].next;
        }
        let id = self.create_slab()?;
        let node = self.slabs[id].allocate_single().ok_or(RuntimeError::TableExhausted {
            table: "fresh slab",
            capacity: self.nodes_per_slab,
        })?;
        Ok(self.carved(id, node, 1))
    }

    /// Allocate `count` contiguous nodes inside one slab.
    pub fn allocate_run(&mut self, count: usize) -> Result<Carved, RuntimeError> {
        if count > self.nodes_per_slab {
            return self.allocate_large(count * self.node_size);
        }
        let mut cursor = self.partial;
        while let Some(id) = cursor {
            if let Some(node) = self.slabs[id].allocate_multiple(count) {
                return Ok(self.carved(id, node, count));
            }
            cursor = self.slabs[id].next;
        }
        let id = self.create_slab()?;
        let node = self.slabs[id]
            .allocate_multiple(count)
            .ok_or(RuntimeError::TableExhausted {
                table: "fresh slab",
                capacity: self.nodes_per_slab,
            })?;
        debug_assert_eq!(node, 0, "fresh slab must start at node zero");
        Ok(self.carved(id, node, count))
    }

    fn allocate_large(&mut self, bytes: usize) -> Result<Carved, RuntimeError> {
        let page = platform::page_size();
        let rounded = bytes
            .checked_add(page - 1)
            .map(|b| b & !(page - 1))
            .ok_or(RuntimeError::Map {
                len: bytes,
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            })?;
        let base = platform::map_shared(rounded)?;
        let id = self.insert_slab(Slab {
            base,
            bytes: rounded,
            bitmap: NodeBitmap::new(0),
            first_unused: 0,
            used_begin: 0,
            used_end: 0,
            allocated: 0,
            list: ListKind::Large,
            prev: None,
            next: None,
        });
        self.push_front(ListKind::Large, id);
        Ok(Carved {
            canonical: base,
            slab: id,
            first_node: 0,
            nodes: rounded.div_ceil(self.node_size),
            large: true,
        })
    }

    fn carved(&mut self, id: SlabId, node: usize, nodes: usize) -> Carved {
        if self.slabs[id].is_full() && self.slabs[id].list == ListKind::Partial {
            self.unlink(id);
            self.push_front(ListKind::Full, id);
        }
        Carved {
            canonical: self.slabs[id].base + node * self.node_size,
            slab: id,
            first_node: node,
            nodes,
            large: false,
        }
    }

    fn create_slab(&mut self) -> Result<SlabId, RuntimeError> {
        let page = platform::page_size();
        let base = platform::map_shared(page)?;
        let id = self.insert_slab(Slab {
            base,
            bytes: page,
            bitmap: NodeBitmap::new(self.nodes_per_slab),
            first_unused: 0,
            used_begin: 0,
            used_end: 0,
            allocated: 0,
            list: ListKind::Vacant,
            prev: None,
            next: None,
        });
        self.push_front(ListKind::Partial, id);
        Ok(id)
    }

    fn insert_slab(&mut self, slab: Slab) -> SlabId {
        let base = slab.base;
        let id = match self.vacant.pop() {
            Some(id) => {
                self.slabs[id] = slab;
                id
            }
            None => {
                self.slabs.push(slab);
                self.slabs.len() - 1
            }
        };
        self.by_base.insert(base, id);
        id
    }

    /// Slab containing canonical address `addr`.
    #[must_use]
    pub fn slab_of(&self, addr: usize) -> Option<SlabId> {
        let (&base, &id) = self.by_base.range(..=addr).next_back()?;
        (addr < base + self.slabs[id].bytes).then_some(id)
    }

    /// Free the run starting at canonical address `addr`.
    pub fn free(&mut self, addr: usize) -> SlabFree {
        let Some(id) = self.slab_of(addr) else {
            return SlabFree::NotOwned;
        };

        if self.slabs[id].is_large() {
            if addr != self.slabs[id].base {
                return SlabFree::NotAllocated;
            }
            let bytes = self.slabs[id].bytes;
            self.release(id);
            return SlabFree::LargeArray { bytes };
        }

        let offset = addr - self.slabs[id].base;
        if offset % self.node_size != 0 {
            return SlabFree::NotAllocated;
        }
        let was_full = self.slabs[id].list == ListKind::Full;
        let nodes = match self.slabs[id].free_run(offset / self.node_size) {
            RunFree::Freed { nodes } => nodes,
            RunFree::NotAllocated | RunFree::NotStart => return SlabFree::NotAllocated,
        };

        if was_full {
            self.unlink(id);
            match self.partial {
                Some(head) if self.slabs[head].is_empty() => self.insert_after(head, id),
                _ => self.push_front(ListKind::Partial, id),
            }
        }
        if self.slabs[id].is_empty() && self.partial != Some(id) {
            self.unlink(id);
            self.push_front(ListKind::Partial, id);
        }
        SlabFree::Nodes { slab: id, nodes }
    }

    /// Byte length of the live run starting at canonical `addr`.
    #[must_use]
    pub fn run_bytes(&self, addr: usize) -> Option<usize> {
        let id = self.slab_of(addr)?;
        let slab = &self.slabs[id];
        if slab.is_large() {
            return (addr == slab.base).then_some(slab.bytes);
        }
        let offset = addr - slab.base;
        if offset % self.node_size != 0 {
            return None;
        }
        let idx = offset / self.node_size;
        if !slab.bitmap.is_start(idx) {
            return None;
        }
        let mut end = idx + 1;
        while end < slab.used_end && !slab.bitmap.is_start(end) && slab.bitmap.is_allocated(end)
        {
            end += 1;
        }
        Some((end - idx) * self.node_size)
    }

    fn release(&mut self, id: SlabId) {
        self.unlink(id);
        let slab = &mut self.slabs[id];
        self.by_base.remove(&slab.base);
        // SAFETY: the slab owned this mapping and the caller has retired
        // every allocation in it.
        unsafe { platform::unmap(slab.base, slab.bytes) };
        slab.bytes = 0;
        slab.list = ListKind::Vacant;
        self.vacant.push(id);
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            node_size: self.node_size,
            nodes_per_slab: self.nodes_per_slab,
            ..PoolStats::default()
        };
        for slab in &self.slabs {
            match slab.list {
                ListKind::Partial => stats.partial_slabs += 1,
                ListKind::Full => stats.full_slabs += 1,
                ListKind::Large => {
                    stats.large_arrays += 1;
                    stats.large_array_bytes += slab.bytes;
                    continue;
                }
                ListKind::Vacant => continue,
            }
            stats.live_nodes += slab.allocated;
            stats.capacity_nodes += slab.nodes();
        }
        stats
    }

    /// Ids on the partial list, head first.
    #[must_use]
    pub fn partial_order(&self) -> Vec<SlabId> {
        let mut out = Vec::new();
        let mut cursor = self.partial;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.slabs[id].next;
        }
        out
    }

    fn head(&mut self, list: ListKind) -> &mut Option<SlabId> {
        match list {
            ListKind::Partial | ListKind::Vacant => &mut self.partial,
            ListKind::Full => &mut self.full,
            ListKind::Large => &mut self.large,
        }
    }

    fn push_front(&mut self, list: ListKind, id: SlabId) {
        let old = *self.head(list);
        if let Some(old) = old {
            self.slabs[old].prev = Some(id);
        }
        let slab = &mut self.slabs[id];
        slab.prev = None;
        slab.next = old;
        slab.list = list;
        *self.head(list) = Some(id);
    }

    fn insert_after(&mut self, after: SlabId, id: SlabId) {
        let next = self.slabs[after].next;
        if let Some(next) = next {
            self.slabs[next].prev = Some(id);
        }
        self.slabs[after].next = Some(id);
        let list = self.slabs[after].list;
        let slab = &mut self.slabs[id];
        slab.prev = Some(after);
        slab.next = next;
        slab.list = list;
    }

    fn unlink(&mut self, id: SlabId) {
        let (prev, next, list) = {
            let slab = &self.slabs[id];
            (slab.prev, slab.next, slab.list)
        };
        match prev {
            Some(prev) => self.slabs[prev].next = next,
            None => {
                let head = self.head(list);
                if *head == Some(id) {
                    *head = next;
                }
            }
        }
        if let Some(next) = next {
            self.slabs[next].prev = prev;
        }
        let slab = &mut self.slabs[id];
        slab.prev = None;
        slab.next = None;
    }
}

impl Drop for SlabAllocator {
    fn drop(&mut self) {
        for slab in &self.slabs {
            if slab.list != ListKind::Vacant && slab.bytes != 0 {
                // SAFETY: dropping the allocator ends every allocation it made.
                unsafe { platform::unmap(slab.base, slab.bytes) };
            }
        }
    }
}
