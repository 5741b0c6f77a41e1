//! Structured violation records.
//!
//! A [`Violation`] is the single call-out record handed to the reporting side
//! for every memory-safety finding. It is serializable so the JSONL report
//! log and the harness can consume it unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provenance::{DebugMetaData, Provenance, SourceSite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Indexing result outside the source object.
    OutOfBounds,
    /// Dereference of a pointer not found in any registry.
    LoadStoreViolation,
    /// Access to a freed object.
    DanglingPointer,
    /// Result not at the expected intra-object offset.
    AlignmentViolation,
    /// Indirect call target outside the known candidate set.
    FunctionPointerViolation,
    /// Captured key does not match the live lock.
    TemporalViolation,
    /// Broken engine invariant. Never tolerated.
    InternalConsistencyViolation,
    /// Free of an address that is not a live allocation of the pool.
    InvalidFree,
    /// Second free of the same allocation.
    DoubleFree,
    /// A checked library call would write past its destination object.
    WriteOutOfBounds,
}

impl ViolationKind {
    pub const ALL: [Self; 10] = [
        Self::OutOfBounds,
        Self::LoadStoreViolation,
        Self::DanglingPointer,
        Self::AlignmentViolation,
        Self::FunctionPointerViolation,
        Self::TemporalViolation,
        Self::InternalConsistencyViolation,
        Self::InvalidFree,
        Self::DoubleFree,
        Self::WriteOutOfBounds,
    ];

    /// Internal-consistency failures terminate regardless of mode.
    #[must_use]
    pub const fn always_fatal(self) -> bool {
        matches!(self, Self::InternalConsistencyViolation)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfBounds => "out_of_bounds",
            Self::LoadStoreViolation => "load_store_violation",
            Self::DanglingPointer => "dangling_pointer",
            Self::AlignmentViolation => "alignment_violation",
            Self::FunctionPointerViolation => "function_pointer_violation",
            Self::TemporalViolation => "temporal_violation",
            Self::InternalConsistencyViolation => "internal_consistency_violation",
            Self::InvalidFree => "invalid_free",
            Self::DoubleFree => "double_free",
            Self::WriteOutOfBounds => "write_out_of_bounds",
        }
    }

    /// Headline used in the text report.
    #[must_use]
    pub const fn headline(self) -> &'static str {
        match self {
            Self::OutOfBounds => "Bounds violation",
            Self::LoadStoreViolation => "Load/Store violation",
            Self::DanglingPointer => "Dangling pointer access",
            Self::AlignmentViolation => "Alignment violation",
            Self::FunctionPointerViolation => "Function pointer violation",
            Self::TemporalViolation => "Temporal violation",
            Self::InternalConsistencyViolation => "Internal consistency violation",
            Self::InvalidFree => "Invalid free",
            Self::DoubleFree => "Double free",
            Self::WriteOutOfBounds => "Write out of bounds",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open extent `[start, end)` of the object a pointer was matched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectBounds {
    pub start: usize,
    pub end: usize,
}

impl ObjectBounds {
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self {
            start,
            end: start.wrapping_add(len),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} at {fault_address:#x}")]
pub struct Violation {
    pub kind: ViolationKind,
    pub fault_address: usize,
    pub pc: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_pointer: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_pointer: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectBounds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Violation {
    #[must_use]
    pub fn new(kind: ViolationKind, fault_address: usize) -> Self {
        Self {
            kind,
            fault_address,
            pc: 0,
            source_pointer: None,
            result_pointer: None,
            object: None,
            provenance: None,
            source_file: None,
            source_line: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ViolationKind::InternalConsistencyViolation, 0).with_detail(detail)
    }

    #[must_use]
    pub fn with_index(mut self, source: usize, result: usize) -> Self {
        self.source_pointer = Some(source);
        self.result_pointer = Some(result);
        self
    }

    #[must_use]
    pub fn with_object(mut self, bounds: ObjectBounds) -> Self {
        self.object = Some(bounds);
        self
    }

    #[must_use]
    pub fn with_provenance(mut self, meta: &DebugMetaData) -> Self {
        self.provenance = Some(meta.provenance());
        self
    }

    #[must_use]
    pub fn with_raw_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Attach the call site. Keeps an already-set program counter when the
    /// site does not know its own.
    #[must_use]
    pub fn at(mut self, site: &SourceSite) -> Self {
        if site.pc != 0 {
            self.pc = site.pc;
        }
        self.source_file = site.file.as_deref().map(str::to_string);
        if site.line != 0 {
            self.source_line = Some(site.line);
        }
        self
    }

    #[must_use]
    pub fn with_pc(mut self, pc: usize) -> Self {
        self.pc = pc;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
