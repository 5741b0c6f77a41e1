// All extern "C" entry points accept raw pointers from instrumented code; the
// runtime validates them, so per-function safety docs would be redundant
// boilerplate.
#![allow(clippy::missing_safety_doc)]
//! # safepool-abi
//!
//! `extern "C"` call-in surface of the SafePool runtime.
//!
//! This crate produces a `cdylib` (`libsafepool.so`) that instrumented
//! programs link against. Every symbol is prefixed `safepool_` and forwards
//! to one process-wide [`Runtime`](safepool_membrane::Runtime) configured
//! from the `SAFEPOOL_*` environment variables on first use.
//!
//! # Architecture
//!
//! ```text
//! instrumented code -> safepool_* entry (this crate) -> Runtime -> report/continue/abort
//! ```
//!
//! - `pool_abi`: pool lifecycle, allocation, registration, stack frames
//! - `check_abi`: load/store, index, alignment, exact and indirect-call checks
//! - `cstdlib_abi`: bounded `<string.h>` routines over pool operands
//! - `softbound_abi`: metadata trie, shadow stack, key/lock minting

mod util;

pub mod check_abi;
pub mod cstdlib_abi;
pub mod pool_abi;
pub mod runtime_state;
pub mod softbound_abi;

pub use pool_abi::SafePool;
pub use softbound_abi::SafepoolMetadata;
