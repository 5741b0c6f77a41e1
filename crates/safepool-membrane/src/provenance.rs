//! Allocation provenance records.

use std::panic::Location;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Where a runtime call came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSite {
    /// Program counter of the call, 0 when unknown.
    pub pc: usize,
    pub file: Option<Arc<str>>,
    pub line: u32,
}

impl SourceSite {
    pub const UNKNOWN: Self = Self {
        pc: 0,
        file: None,
        line: 0,
    };

    #[must_use]
    pub fn new(pc: usize, file: Option<&str>, line: u32) -> Self {
        Self {
            pc,
            file: file.map(Arc::from),
            line,
        }
    }

    /// The Rust source location of the caller.
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            pc: 0,
            file: Some(Arc::from(location.file())),
            line: location.line(),
        }
    }
}

/// Epochs and sites of one allocation, as carried by violation reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub alloc_epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_epoch: Option<u64>,
    pub alloc_pc: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_pc: Option<usize>,
    pub canonical: usize,
}

/// Debug record attached to every pool allocation.
///
/// A fresh record is created on every allocation, even when the slab node is
/// recycled, and it is stamped exactly once when the object is freed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMetaData {
    pub alloc_epoch: u64,
    pub free_epoch: Option<u64>,
    pub alloc_site: SourceSite,
    pub free_site: Option<SourceSite>,
    /// Canonical (slab-backed) address of the object.
    pub canonical: usize,
}

impl DebugMetaData {
    #[must_use]
    pub fn new(alloc_epoch: u64, site: SourceSite, canonical: usize) -> Self {
        Self {
            alloc_epoch,
            free_epoch: None,
            alloc_site: site,
            free_site: None,
            canonical,
        }
    }

    /// Record the free. Returns false if the record was already stamped.
    pub fn stamp_free(&mut self, free_epoch: u64, site: SourceSite) -> bool {
        if self.free_epoch.is_some() {
            return false;
        }
        self.free_epoch = Some(free_epoch);
        self.free_site = Some(site);
        true
    }

    #[must_use]
    pub fn is_freed(&self) -> bool {
        self.free_epoch.is_some()
    }

    #[must_use]
    pub fn provenance(&self) -> Provenance {
        Provenance {
            alloc_epoch: self.alloc_epoch,
            free_epoch: self.free_epoch,
            alloc_pc: self.alloc_site.pc,
            free_pc: self.free_site.as_ref().map(|site| site.pc),
            canonical: self.canonical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_is_stamped_once() {
        let mut meta = DebugMetaData::new(7, SourceSite::new(0x1000, Some("a.c"), 3), 0x5000);
        assert!(!meta.is_freed());
        assert!(meta.stamp_free(2, SourceSite::new(0x2000, None, 0)));
        assert!(!meta.stamp_free(3, SourceSite::UNKNOWN));
        let prov = meta.provenance();
        assert_eq!(prov.alloc_epoch, 7);
        assert_eq!(prov.free_epoch, Some(2));
        assert_eq!(prov.alloc_pc, 0x1000);
        assert_eq!(prov.free_pc, Some(0x2000));
        assert_eq!(prov.canonical, 0x5000);
    }

    #[test]
    fn caller_site_points_here() {
        let site = SourceSite::caller();
        assert!(site.file.as_deref().is_some_and(|f| f.ends_with("provenance.rs")));
        assert!(site.line > 0);
    }
}
