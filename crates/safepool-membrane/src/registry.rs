//! Ordered range index of live objects.
//!
//! Entries are non-overlapping `[base, base+len)` ranges keyed by `base` in a
//! B-tree, so a point query is one predecessor lookup: the entry with the
//! greatest base not above the address, accepted only if the address falls
//! inside it.

use std::collections::BTreeMap;

/// A registered object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub base: usize,
    pub len: usize,
    pub tag: T,
}

impl<T> Entry<T> {
    #[must_use]
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.len)
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.base <= addr && addr < self.end()
    }
}

/// Range index mapping address ranges to tags of type `T`.
#[derive(Debug)]
pub struct ObjectRegistry<T> {
    entries: BTreeMap<usize, (usize, T)>,
}

impl<T> Default for ObjectRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectRegistry<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `[base, base+len)`. A zero length registers one byte.
    ///
    /// Stale entries overlapping the new range are evicted and returned, so the
    /// registry never holds two overlapping objects.
    pub fn insert(&mut self, base: usize, len: usize, tag: T) -> Vec<Entry<T>> {
        let len = len.max(1);
        let evicted = self.remove_overlapping(base, len);
        self.entries.insert(base, (len, tag));
        evicted
    }

    /// Remove every entry intersecting `[base, base+len)`.
    pub fn remove_overlapping(&mut self, base: usize, len: usize) -> Vec<Entry<T>> {
        let end = base.saturating_add(len.max(1));
        let mut doomed: Vec<usize> = self
            .entries
            .range(base..end)
            .map(|(start, _)| *start)
            .collect();
        if let Some((&start, &(entry_len, _))) = self.entries.range(..base).next_back() {
            if start.saturating_add(entry_len) > base {
                doomed.push(start);
            }
        }
        doomed
            .into_iter()
            .filter_map(|start| {
                self.entries
                    .remove(&start)
                    .map(|(len, tag)| Entry { base: start, len, tag })
            })
            .collect()
    }

    /// Cut `[base, base+len)` out of the registry. Entries straddling the
    /// range keep the parts outside it; entries inside it are dropped.
    pub fn trim_overlapping(&mut self, base: usize, len: usize)
    where
        T: Clone,
    {
        let end = base.saturating_add(len.max(1));
        for entry in self.remove_overlapping(base, len) {
            if entry.base < base {
                self.entries
                    .insert(entry.base, (base - entry.base, entry.tag.clone()));
            }
            if entry.end() > end {
                self.entries.insert(end, (entry.end() - end, entry.tag));
            }
        }
    }

    /// Remove the entry starting exactly at `base`.
    pub fn remove(&mut self, base: usize) -> Option<Entry<T>> {
        self.entries
            .remove(&base)
            .map(|(len, tag)| Entry { base, len, tag })
    }

    /// The object containing `addr`, if any.
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<Entry<&T>> {
        let (&base, (len, tag)) = self.entries.range(..=addr).next_back()?;
        let entry = Entry {
            base,
            len: *len,
            tag,
        };
        entry.contains(addr).then_some(entry)
    }

    /// Mutable access to the tag of the object containing `addr`.
    pub fn find_mut(&mut self, addr: usize) -> Option<(usize, usize, &mut T)> {
        let (&base, (len, tag)) = self.entries.range_mut(..=addr).next_back()?;
        (addr < base.saturating_add(*len)).then_some((base, *len, tag))
    }

    /// Resolve `addr` to the base and length of its object.
    #[must_use]
    pub fn retrieve(&self, addr: usize) -> Option<(usize, usize)> {
        self.find(addr).map(|entry| (entry.base, entry.len))
    }

    pub fn iter(&self) -> impl Iterator<Item = Entry<&T>> {
        self.entries.iter().map(|(&base, (len, tag))| Entry {
            base,
            len: *len,
            tag,
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
