//! Errors raised by the runtime's own machinery.
//!
//! These are distinct from [`Violation`](crate::Violation)s: a violation is a
//! finding about the instrumented program, a `RuntimeError` means the engine
//! could not do its job (the OS refused a mapping, a fixed table ran out).

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("mmap of {len} bytes failed: {source}")]
    Map { len: usize, source: io::Error },

    #[error("mremap alias of {len} bytes at {addr:#x} failed: {source}")]
    Remap {
        addr: usize,
        len: usize,
        source: io::Error,
    },

    #[error("mprotect of {len} bytes at {addr:#x} failed: {source}")]
    Protect {
        addr: usize,
        len: usize,
        source: io::Error,
    },

    #[error("failed to install handler for signal {signal}: {source}")]
    SignalInstall { signal: i32, source: io::Error },

    #[error("invalid value {value:?} for {key}")]
    ConfigValue { key: &'static str, value: String },

    #[error("sentinel range exhausted after {issued} rewrites")]
    SentinelExhausted { issued: usize },

    #[error("address {addr:#x} is not an issued sentinel")]
    UnknownSentinel { addr: usize },

    #[error("{table} exhausted ({capacity} entries)")]
    TableExhausted {
        table: &'static str,
        capacity: usize,
    },

    #[error("slab run at {addr:#x} could not be returned after: {source}")]
    Rollback {
        addr: usize,
        source: Box<RuntimeError>,
    },

    #[error("shadow stack {0}")]
    ShadowStack(&'static str),

    #[error("failed to start check worker: {0}")]
    Worker(#[source] io::Error),

    #[error("report log: {0}")]
    ReportLog(#[from] io::Error),
}

impl RuntimeError {
    pub(crate) fn last_os_map(len: usize) -> Self {
        Self::Map {
            len,
            source: io::Error::last_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_keeps_the_original_failure() {
        let err = RuntimeError::Rollback {
            addr: 0x1000,
            source: Box::new(RuntimeError::ShadowStack("overflow")),
        };
        assert_eq!(
            err.to_string(),
            "slab run at 0x1000 could not be returned after: shadow stack overflow"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
