//! Lock-and-key temporal metadata.
//!
//! Every allocation receives a fresh key and a lock cell holding that key.
//! Deallocation zeroes the cell, so any pointer still carrying the old key
//! fails the temporal check even after the cell is reused for a newer
//! allocation with a different key. Keys start at 2; key 1 lives in the
//! global lock cell shared by objects that never die.
//!
//! Heap cells come from a mapped table with a LIFO free list. Stack cells are
//! a cursor that grows on frame entry and shrinks on exit. The free map
//! records `key -> pointer` for live heap objects so deallocation can reject
//! frees of pointers that were never allocated or were already freed.

#![allow(unsafe_code)]

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::RuntimeError;
use crate::platform;

/// Key held by the global lock.
pub const GLOBAL_KEY: usize = 1;
/// First key handed to an allocation.
pub const FIRST_KEY: usize = 2;

/// Free-map tag of a slot that was used and released.
const TOMBSTONE: usize = 2;

/// A mapped, zero-initialized array of word cells.
struct Cells {
    base: usize,
    len: usize,
}

impl Cells {
    fn new(len: usize) -> Result<Self, RuntimeError> {
        let len = len.max(1);
        Ok(Self {
            base: platform::map_noreserve(len * mem::size_of::<usize>())?,
            len,
        })
    }

    fn cell(&self, idx: usize) -> &AtomicUsize {
        debug_assert!(idx < self.len);
        // SAFETY: idx < len and the mapping lives as long as self.
        unsafe { &*(self.base as *const AtomicUsize).add(idx) }
    }

    fn addr_of(&self, idx: usize) -> usize {
        self.base + idx * mem::size_of::<usize>()
    }

    fn index_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let idx = offset / mem::size_of::<usize>();
        (offset % mem::size_of::<usize>() == 0 && idx < self.len).then_some(idx)
    }
}

impl Drop for Cells {
    fn drop(&mut self) {
        // SAFETY: mapped in `Cells::new`; cells are only borrowed through self.
        unsafe { platform::unmap(self.base, self.len * mem::size_of::<usize>()) };
    }
}

/// Outcome of removing a pointer from the free map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeMapRemoval {
    Removed,
    /// No live entry for this key and pointer.
    Missing,
}

/// Open-addressed `key -> pointer` table with bounded linear probing.
struct FreeMap {
    cells: Cells,
    max_probe: usize,
}

impl FreeMap {
    fn new(entries: usize, max_probe: usize) -> Result<Self, RuntimeError> {
        Ok(Self {
            cells: Cells::new(entries)?,
            max_probe: max_probe.max(1),
        })
    }

    fn probe(&self, key: usize) -> impl Iterator<Item = &AtomicUsize> {
        let len = self.cells.len;
        (0..self.max_probe.min(len)).map(move |step| self.cells.cell((key + step) % len))
    }

    fn insert(&self, key: usize, ptr: usize) -> Result<(), RuntimeError> {
        debug_assert!(ptr > TOMBSTONE);
        for cell in self.probe(key) {
            let tag = cell.load(Ordering::Relaxed);
            if tag == 0 || tag == TOMBSTONE {
                cell.store(ptr, Ordering::Relaxed);
                return Ok(());
            }
        }
        Err(RuntimeError::TableExhausted {
            table: "free map",
            capacity: self.cells.len,
        })
    }

    fn remove(&self, key: usize, ptr: usize) -> FreeMapRemoval {
        for cell in self.probe(key) {
            let tag = cell.load(Ordering::Relaxed);
            if tag == 0 {
                return FreeMapRemoval::Missing;
            }
            if tag == ptr {
                cell.store(TOMBSTONE, Ordering::Relaxed);
                return FreeMapRemoval::Removed;
            }
        }
        FreeMapRemoval::Missing
    }
}

/// Key/lock pair issued for one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLock {
    pub key: usize,
    /// Address of the lock cell.
    pub lock: usize,
}

pub struct TemporalState {
    heap: Cells,
    heap_free: Vec<usize>,
    heap_next: usize,
    stack: Cells,
    stack_cursor: usize,
    global: Cells,
    next_key: usize,
    free_map: FreeMap,
}

impl TemporalState {
    pub fn new(
        heap_entries: usize,
        stack_entries: usize,
        free_map_entries: usize,
        free_map_max_probe: usize,
    ) -> Result<Self, RuntimeError> {
        let global = Cells::new(1)?;
        global.cell(0).store(GLOBAL_KEY, Ordering::Relaxed);
        Ok(Self {
            heap: Cells::new(heap_entries)?,
            heap_free: Vec::new(),
            heap_next: 0,
            stack: Cells::new(stack_entries)?,
            stack_cursor: 0,
            global,
            next_key: FIRST_KEY,
            free_map: FreeMap::new(free_map_entries, free_map_max_probe)?,
        })
    }

    /// Address of the global lock, which always holds [`GLOBAL_KEY`].
    #[must_use]
    pub fn global_lock(&self) -> usize {
        self.global.addr_of(0)
    }

    fn fresh_key(&mut self) -> usize {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    /// Issue a key and lock for heap object `ptr`.
    pub fn heap_allocation(&mut self, ptr: usize) -> Result<KeyLock, RuntimeError> {
        let idx = match self.heap_free.pop() {
            Some(idx) => idx,
            None if self.heap_next < self.heap.len => {
                self.heap_next += 1;
                self.heap_next - 1
            }
            None => {
                return Err(RuntimeError::TableExhausted {
                    table: "heap lock table",
                    capacity: self.heap.len,
                });
            }
        };
        let key = self.fresh_key();
        if let Err(err) = self.free_map.insert(key, ptr) {
            self.heap_free.push(idx);
            return Err(err);
        }
        self.heap.cell(idx).store(key, Ordering::Relaxed);
        Ok(KeyLock {
            key,
            lock: self.heap.addr_of(idx),
        })
    }

    /// Release the lock of heap object `ptr`. A pointer whose key has no
    /// live free-map entry is reported as [`FreeMapRemoval::Missing`] and its
    /// lock is left untouched.
    pub fn heap_deallocation(&mut self, ptr: usize, key: usize, lock: usize) -> FreeMapRemoval {
        let Some(idx) = self.heap.index_of(lock) else {
            return FreeMapRemoval::Missing;
        };
        if self.heap.cell(idx).load(Ordering::Relaxed) != key {
            return FreeMapRemoval::Missing;
        }
        if self.free_map.remove(key, ptr) == FreeMapRemoval::Missing {
            return FreeMapRemoval::Missing;
        }
        self.heap.cell(idx).store(0, Ordering::Relaxed);
        self.heap_free.push(idx);
        FreeMapRemoval::Removed
    }

    /// Issue a key and lock for a new stack frame.
    pub fn stack_allocation(&mut self) -> Result<KeyLock, RuntimeError> {
        if self.stack_cursor >= self.stack.len {
            return Err(RuntimeError::TableExhausted {
                table: "stack lock table",
                capacity: self.stack.len,
            });
        }
        let idx = self.stack_cursor;
        self.stack_cursor += 1;
        let key = self.fresh_key();
        self.stack.cell(idx).store(key, Ordering::Relaxed);
        Ok(KeyLock {
            key,
            lock: self.stack.addr_of(idx),
        })
    }

    /// Release the innermost stack frame's lock.
    pub fn stack_deallocation(&mut self) -> Result<(), RuntimeError> {
        if self.stack_cursor == 0 {
            return Err(RuntimeError::ShadowStack("lock cursor underflow"));
        }
        self.stack_cursor -= 1;
        self.stack.cell(self.stack_cursor).store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Current content of the lock cell at `lock`, or `None` when `lock` is
    /// not a cell owned by this state.
    #[must_use]
    pub fn read_lock(&self, lock: usize) -> Option<usize> {
        if let Some(idx) = self.heap.index_of(lock) {
            return Some(self.heap.cell(idx).load(Ordering::Relaxed));
        }
        if let Some(idx) = self.stack.index_of(lock) {
            return Some(self.stack.cell(idx).load(Ordering::Relaxed));
        }
        self.global
            .index_of(lock)
            .map(|idx| self.global.cell(idx).load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn live_stack_frames(&self) -> usize {
        self.stack_cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TemporalState {
        TemporalState::new(4, 4, 64, 8).expect("tables")
    }

    #[test]
    fn keys_start_after_the_global_key() {
        let mut st = state();
        assert_eq!(st.read_lock(st.global_lock()), Some(GLOBAL_KEY));
        let a = st.heap_allocation(0x1000).expect("alloc");
        assert_eq!(a.key, FIRST_KEY);
        assert_eq!(st.read_lock(a.lock), Some(FIRST_KEY));
    }

    #[test]
    fn reused_lock_carries_a_new_key() {
        let mut st = state();
        let a = st.heap_allocation(0x1000).expect("alloc");
        assert_eq!(st.heap_deallocation(0x1000, a.key, a.lock), FreeMapRemoval::Removed);
        assert_eq!(st.read_lock(a.lock), Some(0));
        let b = st.heap_allocation(0x2000).expect("alloc");
        assert_eq!(b.lock, a.lock);
        assert_ne!(b.key, a.key);
        assert_eq!(st.read_lock(b.lock), Some(b.key));
    }

    #[test]
    fn double_free_is_missing() {
        let mut st = state();
        let a = st.heap_allocation(0x1000).expect("alloc");
        assert_eq!(st.heap_deallocation(0x1000, a.key, a.lock), FreeMapRemoval::Removed);
        assert_eq!(st.heap_deallocation(0x1000, a.key, a.lock), FreeMapRemoval::Missing);
        assert_eq!(st.heap_deallocation(0x9000, 77, 0x10), FreeMapRemoval::Missing);
    }

    #[test]
    fn heap_table_exhaustion_is_an_error() {
        let mut st = state();
        for i in 0..4 {
            st.heap_allocation(0x1000 * (i + 1)).expect("alloc");
        }
        assert!(matches!(
            st.heap_allocation(0x9000),
            Err(RuntimeError::TableExhausted { .. })
        ));
    }

    #[test]
    fn stack_locks_follow_the_cursor() {
        let mut st = state();
        let outer = st.stack_allocation().expect("outer");
        let inner = st.stack_allocation().expect("inner");
        assert_eq!(st.live_stack_frames(), 2);
        st.stack_deallocation().expect("pop");
        assert_eq!(st.read_lock(inner.lock), Some(0));
        assert_eq!(st.read_lock(outer.lock), Some(outer.key));
        st.stack_deallocation().expect("pop");
        assert!(st.stack_deallocation().is_err());
    }

    #[test]
    fn foreign_lock_is_unknown() {
        let st = state();
        assert_eq!(st.read_lock(0x10), None);
    }
}
