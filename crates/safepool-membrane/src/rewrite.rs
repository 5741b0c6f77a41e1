//! Out-of-bounds pointer rewriting.
//!
//! A tolerated out-of-bounds result is replaced by a sentinel drawn from a
//! reserved, permanently inaccessible address range. The rewriter remembers
//! the original value and the bounds of the object it was derived from, so
//! later arithmetic on the sentinel can still be checked against the right
//! object and comparisons can recover the original pointer.
//!
//! Sentinels are issued from a cursor that only moves forward. Running off
//! the end of the range is fatal: a sentinel still held by the program must
//! never be reissued for a different pointer.

#![allow(unsafe_code)]

use std::collections::HashMap;

use crate::error::RuntimeError;
use crate::platform;

/// The reserved sentinel address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelRange {
    pub start: usize,
    pub end: usize,
}

impl SentinelRange {
    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// What a sentinel stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rewritten {
    pub original: usize,
    pub obj_start: usize,
    pub obj_end: usize,
}

pub struct OobRewriter {
    range: SentinelRange,
    cursor: usize,
    entries: HashMap<usize, Rewritten>,
}

impl OobRewriter {
    /// Reserve `bytes` of address space for sentinels.
    pub fn new(bytes: usize) -> Result<Self, RuntimeError> {
        let len = platform::page_round_up(bytes);
        let start = platform::map_reserved(len)?;
        Ok(Self {
            range: SentinelRange {
                start,
                end: start + len,
            },
            cursor: start,
            entries: HashMap::new(),
        })
    }

    #[must_use]
    pub fn range(&self) -> SentinelRange {
        self.range
    }

    /// Sentinels issued so far.
    #[must_use]
    pub fn issued(&self) -> usize {
        self.cursor - self.range.start
    }

    /// Sentinels still available.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.range.end - self.cursor
    }

    /// Issue a fresh sentinel standing for `original`.
    pub fn rewrite(
        &mut self,
        original: usize,
        obj_start: usize,
        obj_end: usize,
    ) -> Result<usize, RuntimeError> {
        if self.cursor >= self.range.end {
            return Err(RuntimeError::SentinelExhausted {
                issued: self.issued(),
            });
        }
        let sentinel = self.cursor;
        self.cursor += 1;
        self.entries.insert(
            sentinel,
            Rewritten {
                original,
                obj_start,
                obj_end,
            },
        );
        Ok(sentinel)
    }

    #[must_use]
    pub fn lookup(&self, sentinel: usize) -> Option<Rewritten> {
        self.entries.get(&sentinel).copied()
    }

    /// Original value of `addr`. Addresses outside the sentinel range are
    /// returned unchanged; an address inside it that was never issued is an
    /// internal error.
    pub fn unrewrite(&self, addr: usize) -> Result<usize, RuntimeError> {
        if !self.range.contains(addr) {
            return Ok(addr);
        }
        self.lookup(addr)
            .map(|entry| entry.original)
            .ok_or(RuntimeError::UnknownSentinel { addr })
    }
}

impl Drop for OobRewriter {
    fn drop(&mut self) {
        // SAFETY: the range was reserved by `new` and is never dereferenced.
        unsafe { platform::unmap(self.range.start, self.range.end - self.range.start) };
    }
}
