//! Runtime memory-safety engine for instrumented programs.
//!
//! Instrumented code calls into a [`Runtime`] to allocate pool objects, to
//! check that pointer arithmetic stays inside the object it started from,
//! and to catch uses of freed memory. A second, registry-free backend keeps
//! per-pointer metadata instead of per-object records.
//!
//! # Architecture
//!
//! The engine consists of:
//! - **Slab allocator** (`slab`, `bitmap`): node-granular slabs with an
//!   out-of-band allocation bitmap, plus dedicated large-array mappings
//! - **Object registry** (`registry`): ordered range index from address to
//!   object bounds and provenance
//! - **Pools** (`pool`): allocator, registries and stack frames of one pool
//! - **Check engine** (`check`, `exact`): index, load/store, alignment and
//!   exact checks
//! - **Checked library calls** (`cstdlib`): `<string.h>` routines bounded by
//!   the objects of their operands
//! - **Pointer rewriter** (`rewrite`): sentinel values standing in for
//!   out-of-bounds pointers until they come back in bounds
//! - **Dangling detector** (`dangling`): shadow-page aliases retired on free
//!   and a process-wide fault handler
//! - **Pointer metadata backend** (`softbound`): metadata trie, key/lock
//!   tables and the shadow stack
//! - **Speculative checking** (`speculative`): a worker thread draining a
//!   bounded check queue
//! - **Reporting** (`violation`, `report`, `metrics`): structured violation
//!   records, alert text, JSONL log and atomic counters
//! - **Configuration** (`config`): enforcement and indexing policy

#![deny(unsafe_code)]

pub mod bitmap;
pub mod check;
pub mod config;
pub mod cstdlib;
pub mod dangling;
pub mod error;
pub mod exact;
pub mod metrics;
pub mod platform;
pub mod pool;
pub mod provenance;
pub mod registry;
pub mod report;
pub mod rewrite;
pub mod runtime;
pub mod slab;
pub mod softbound;
pub mod speculative;
pub mod violation;

pub use check::Completeness;
pub use config::{EnforcementMode, IndexingMode, RuntimeConfig, SoftBoundConfig};
pub use cstdlib::Operand;
pub use error::RuntimeError;
pub use metrics::MetricsSnapshot;
pub use pool::{ObjectOrigin, Pool};
pub use provenance::{DebugMetaData, Provenance, SourceSite};
pub use report::ReportSink;
pub use rewrite::SentinelRange;
pub use runtime::Runtime;
pub use slab::PoolStats;
pub use softbound::{Access, Field, KeyLock, PointerMetadata};
pub use speculative::{CheckQueue, CheckRequest};
pub use violation::{ObjectBounds, Violation, ViolationKind};
