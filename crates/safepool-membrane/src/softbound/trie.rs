//! Two-level trie of per-pointer-slot metadata.
//!
//! The primary level is indexed by `slot >> 25`; each populated entry owns a
//! lazily mapped secondary table of 2^22 four-word records indexed by
//! `(slot >> 3) & 0x3f_ffff`, so one secondary covers 32 MiB of slot
//! addresses. Secondaries are reserved with `MAP_NORESERVE` and only ever
//! released when the trie is dropped.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::RuntimeError;
use crate::platform;

const PRIMARY_SHIFT: u32 = 25;
const SLOT_SHIFT: u32 = 3;
const SECONDARY_ENTRIES: usize = 1 << 22;
const SECONDARY_MASK: usize = SECONDARY_ENTRIES - 1;
const SLOT_BYTES: usize = 1 << SLOT_SHIFT;

/// Spatial and temporal metadata of one pointer value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PointerMetadata {
    pub base: usize,
    pub bound: usize,
    pub key: usize,
    pub lock: usize,
}

type Record = [AtomicUsize; 4];

struct Secondary {
    base: usize,
}

impl Secondary {
    const BYTES: usize = SECONDARY_ENTRIES * mem::size_of::<Record>();

    fn new() -> Result<Self, RuntimeError> {
        Ok(Self {
            base: platform::map_noreserve(Self::BYTES)?,
        })
    }

    fn record(&self, slot: usize) -> &Record {
        let idx = (slot >> SLOT_SHIFT) & SECONDARY_MASK;
        // SAFETY: idx < SECONDARY_ENTRIES and the mapping holds that many
        // zero-initialized records for the lifetime of `self`.
        unsafe { &*(self.base as *const Record).add(idx) }
    }
}

impl Drop for Secondary {
    fn drop(&mut self) {
        // SAFETY: mapped by `Secondary::new` and no references outlive self.
        unsafe { platform::unmap(self.base, Self::BYTES) };
    }
}

#[derive(Default)]
pub struct MetadataTrie {
    primary: RwLock<HashMap<usize, Secondary>>,
}

impl MetadataTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Secondary tables mapped so far.
    #[must_use]
    pub fn secondary_tables(&self) -> usize {
        self.primary.read().len()
    }

    /// Metadata of the pointer stored at `slot`. Slots never written read as
    /// all zeros.
    #[must_use]
    pub fn load(&self, slot: usize) -> PointerMetadata {
        let primary = self.primary.read();
        match primary.get(&(slot >> PRIMARY_SHIFT)) {
            Some(table) => {
                let record = table.record(slot);
                PointerMetadata {
                    base: record[0].load(Ordering::Relaxed),
                    bound: record[1].load(Ordering::Relaxed),
                    key: record[2].load(Ordering::Relaxed),
                    lock: record[3].load(Ordering::Relaxed),
                }
            }
            None => PointerMetadata::default(),
        }
    }

    pub fn store(&self, slot: usize, meta: PointerMetadata) -> Result<(), RuntimeError> {
        let index = slot >> PRIMARY_SHIFT;
        {
            let primary = self.primary.read();
            if let Some(table) = primary.get(&index) {
                write_record(table.record(slot), meta);
                return Ok(());
            }
        }
        let mut primary = self.primary.write();
        let table = match primary.entry(index) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => entry.insert(Secondary::new()?),
        };
        write_record(table.record(slot), meta);
        Ok(())
    }

    /// Copy the metadata of `size` bytes of pointer slots from `from` to
    /// `dest`, as `memcpy`/`memmove` of pointer-holding memory requires.
    /// Unaligned sources carry no pointer slots and are ignored.
    pub fn copy_metadata(&self, dest: usize, from: usize, size: usize) -> Result<(), RuntimeError> {
        if from % SLOT_BYTES != 0 {
            return Ok(());
        }
        let slots = size / SLOT_BYTES;
        if dest > from && dest < from + size {
            for i in (0..slots).rev() {
                self.store(dest + i * SLOT_BYTES, self.load(from + i * SLOT_BYTES))?;
            }
        } else {
            for i in 0..slots {
                self.store(dest + i * SLOT_BYTES, self.load(from + i * SLOT_BYTES))?;
            }
        }
        Ok(())
    }
}

fn write_record(record: &Record, meta: PointerMetadata) {
    record[0].store(meta.base, Ordering::Relaxed);
    record[1].store(meta.bound, Ordering::Relaxed);
    record[2].store(meta.key, Ordering::Relaxed);
    record[3].store(meta.lock, Ordering::Relaxed);
}
