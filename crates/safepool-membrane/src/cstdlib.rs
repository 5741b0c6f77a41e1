//! Checked `<string.h>` routines.
//!
//! Every operand is bounded by the object that contains it: a live object of
//! its pool, else an object in the external registry. A call that would read
//! or write past an operand is reported and then performed on the part that
//! fits, so a diagnostic run continues without touching foreign memory.
//!
//! An operand no registry knows is a `LoadStoreViolation` for complete calls;
//! the call is then skipped and returns its neutral value (the destination,
//! zero or null). Incomplete calls treat unknown operands as unbounded.
//! Sentinels and freed objects are always reported.
//!
//! # Safety
//!
//! Bounded operands are read and written only inside their objects. Unbounded
//! operands carry the C function's own contract: the caller vouches for them.

#![allow(unsafe_code)]

use std::ptr;

use crate::check::Completeness;
use crate::metrics::RuntimeMetrics;
use crate::pool::Pool;
use crate::provenance::SourceSite;
use crate::runtime::Runtime;
use crate::violation::{ObjectBounds, Violation, ViolationKind};

/// A pointer argument and the object bounding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub ptr: usize,
    /// `None` for an unknown object under an incomplete check.
    pub object: Option<ObjectBounds>,
}

impl Operand {
    /// Bytes from `ptr` to the end of the object.
    #[must_use]
    pub fn room(&self) -> Option<usize> {
        self.object.map(|object| object.end.saturating_sub(self.ptr))
    }

    fn limit(&self) -> usize {
        self.room().unwrap_or(usize::MAX)
    }
}

/// Length of the string at `op` and whether its NUL lies inside the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Scanned {
    len: usize,
    terminated: bool,
}

/// Count bytes before the first NUL, reading at most `max` bytes.
///
/// # Safety
///
/// `[ptr, ptr + max)` must be readable up to and including the first NUL.
unsafe fn scan_nul(ptr: usize, max: usize) -> usize {
    let mut len = 0;
    // SAFETY: per the caller contract, every byte read precedes or is the NUL.
    while len < max && unsafe { ptr::read((ptr + len) as *const u8) } != 0 {
        len += 1;
    }
    len
}

/// # Safety
///
/// Bounded operands must be readable inside their object; unbounded operands
/// must point to a NUL-terminated string.
unsafe fn scan(op: &Operand) -> Scanned {
    let limit = op.limit();
    // SAFETY: forwarded caller contract.
    let len = unsafe { scan_nul(op.ptr, limit) };
    Scanned {
        len,
        terminated: len < limit,
    }
}

/// # Safety
///
/// `[ptr, ptr + len)` must be readable.
unsafe fn bytes<'a>(ptr: usize, len: usize) -> &'a [u8] {
    if len == 0 {
        return &[];
    }
    // SAFETY: per the caller contract.
    unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }
}

fn unterminated(op: &Operand) -> Violation {
    let mut violation = Violation::new(ViolationKind::OutOfBounds, op.ptr)
        .with_detail("string is not terminated inside its object");
    if let Some(object) = op.object {
        violation = violation.with_object(object);
    }
    violation
}

fn overread(src: &Operand, wanted: usize) -> Violation {
    let mut violation = Violation::new(ViolationKind::OutOfBounds, src.ptr).with_detail(format!(
        "reading {wanted} bytes runs past the source object"
    ));
    if let Some(object) = src.object {
        violation = violation.with_object(object);
    }
    violation
}

fn overflow(dst: &Operand, wanted: usize) -> Violation {
    let mut violation =
        Violation::new(ViolationKind::WriteOutOfBounds, dst.ptr).with_detail(format!(
            "writing {wanted} bytes runs past the destination object ({} bytes of room)",
            dst.room().unwrap_or(0)
        ));
    if let Some(object) = dst.object {
        violation = violation.with_object(object);
    }
    violation
}

impl Runtime {
    /// Object bounding a library operand: the live pool object containing
    /// `ptr`, else the external object containing it.
    #[must_use]
    pub fn operand_bounds(&self, pool: &Pool, ptr: usize) -> Option<ObjectBounds> {
        if let Some(entry) = pool.find(ptr) {
            return Some(ObjectBounds::new(entry.base, entry.len));
        }
        let (base, len) = self.find_external(ptr)?;
        RuntimeMetrics::inc(&self.counters().external_hits);
        Some(ObjectBounds::new(base, len))
    }

    /// Resolve `ptr` to an operand of a library call.
    pub fn try_operand(
        &self,
        pool: &Pool,
        ptr: usize,
        completeness: Completeness,
    ) -> Result<Operand, Violation> {
        if !self.config().mode.checks_enabled() {
            return Ok(Operand { ptr, object: None });
        }
        if let Some(object) = self.operand_bounds(pool, ptr) {
            return Ok(Operand {
                ptr,
                object: Some(object),
            });
        }
        if let Some(entry) = pool.find_freed(ptr) {
            return Err(Violation::new(ViolationKind::DanglingPointer, ptr)
                .with_object(ObjectBounds::new(entry.base, entry.len))
                .with_provenance(entry.tag));
        }
        if ptr == 0 || self.is_sentinel(ptr) || completeness == Completeness::Complete {
            return Err(Violation::new(ViolationKind::LoadStoreViolation, ptr)
                .with_detail("library operand not found in pool"));
        }
        RuntimeMetrics::inc(&self.counters().incomplete_passes);
        Ok(Operand { ptr, object: None })
    }

    fn operand(
        &self,
        pool: &Pool,
        ptr: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> Option<Operand> {
        self.try_operand(pool, ptr, completeness)
            .map_err(|violation| self.enforce(violation.at(site)))
            .ok()
    }

    fn library_call(&self) {
        RuntimeMetrics::inc(&self.counters().library_checks);
    }

    fn clamped(&self, violation: Violation, site: &SourceSite) {
        RuntimeMetrics::inc(&self.counters().clamps);
        self.enforce(violation.at(site));
    }

    /// Scan a string operand, reporting a missing terminator.
    ///
    /// # Safety
    ///
    /// See [`scan`].
    unsafe fn terminated(&self, op: &Operand, site: &SourceSite) -> Scanned {
        // SAFETY: forwarded caller contract.
        let scanned = unsafe { scan(op) };
        if !scanned.terminated {
            self.clamped(unterminated(op), site);
        }
        scanned
    }

    /// Bytes of `n` that fit both operands, reporting each shortfall.
    fn fit_copy(&self, dst: &Operand, src: &Operand, n: usize, site: &SourceSite) -> usize {
        let mut stop = n;
        if stop > src.limit() {
            self.clamped(overread(src, n), site);
            stop = src.limit();
        }
        if stop > dst.limit() {
            self.clamped(overflow(dst, stop), site);
            stop = dst.limit();
        }
        stop
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    /// Checked `memcpy`. Overlapping operands are copied as by `memmove`.
    /// Returns the number of bytes copied.
    ///
    /// # Safety
    ///
    /// Unbounded operands must be valid for `n` bytes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn pool_memcpy(
        &self,
        dst_pool: &Pool,
        src_pool: &Pool,
        dst: usize,
        src: usize,
        n: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        if n == 0 {
            return 0;
        }
        self.library_call();
        let Some(d) = self.operand(dst_pool, dst, completeness, site) else {
            return 0;
        };
        let Some(s) = self.operand(src_pool, src, completeness, site) else {
            return 0;
        };
        let stop = self.fit_copy(&d, &s, n, site);
        // SAFETY: `stop` fits both operands; `ptr::copy` tolerates overlap.
        unsafe { ptr::copy(src as *const u8, dst as *mut u8, stop) };
        stop
    }

    /// Checked `memmove`.
    ///
    /// # Safety
    ///
    /// See [`Runtime::pool_memcpy`].
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn pool_memmove(
        &self,
        dst_pool: &Pool,
        src_pool: &Pool,
        dst: usize,
        src: usize,
        n: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        // SAFETY: forwarded caller contract.
        unsafe { self.pool_memcpy(dst_pool, src_pool, dst, src, n, completeness, site) }
    }

    /// Checked `mempcpy`: returns the address after the last byte written.
    ///
    /// # Safety
    ///
    /// See [`Runtime::pool_memcpy`].
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn pool_mempcpy(
        &self,
        dst_pool: &Pool,
        src_pool: &Pool,
        dst: usize,
        src: usize,
        n: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        // SAFETY: forwarded caller contract.
        dst + unsafe { self.pool_memcpy(dst_pool, src_pool, dst, src, n, completeness, site) }
    }

    /// Checked `memset`. Returns the number of bytes written.
    ///
    /// # Safety
    ///
    /// An unbounded `dst` must be valid for `n` bytes.
    pub unsafe fn pool_memset(
        &self,
        pool: &Pool,
        dst: usize,
        byte: u8,
        n: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        if n == 0 {
            return 0;
        }
        self.library_call();
        let Some(d) = self.operand(pool, dst, completeness, site) else {
            return 0;
        };
        let mut stop = n;
        if stop > d.limit() {
            self.clamped(overflow(&d, n), site);
            stop = d.limit();
        }
        // SAFETY: `stop` fits the destination.
        unsafe { ptr::write_bytes(dst as *mut u8, byte, stop) };
        stop
    }

    // -----------------------------------------------------------------------
    // Lengths
    // -----------------------------------------------------------------------

    /// Checked `strlen`. An unterminated string measures to the end of its
    /// object.
    ///
    /// # Safety
    ///
    /// An unbounded `s` must be NUL-terminated.
    pub unsafe fn pool_strlen(
        &self,
        pool: &Pool,
        s: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        self.library_call();
        let Some(op) = self.operand(pool, s, completeness, site) else {
            return 0;
        };
        // SAFETY: bounded reads stay in the object; unbounded per contract.
        unsafe { self.terminated(&op, site) }.len
    }

    /// Checked `strnlen`. Reading up to `maxlen` bytes must stay in the
    /// object unless a NUL comes first.
    ///
    /// # Safety
    ///
    /// An unbounded `s` must be readable up to `maxlen` bytes or its NUL.
    pub unsafe fn pool_strnlen(
        &self,
        pool: &Pool,
        s: usize,
        maxlen: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        self.library_call();
        let Some(op) = self.operand(pool, s, completeness, site) else {
            return 0;
        };
        let max = maxlen.min(op.limit());
        // SAFETY: `max` stays within the object for bounded operands.
        let len = unsafe { scan_nul(s, max) };
        if len == max && maxlen > max {
            self.clamped(unterminated(&op), site);
        }
        len
    }

    // -----------------------------------------------------------------------
    // Copies
    // -----------------------------------------------------------------------

    /// Checked `strcpy`. A destination too small for the string gets the
    /// prefix that fits, NUL-terminated.
    ///
    /// # Safety
    ///
    /// Unbounded operands carry the `strcpy` contract.
    pub unsafe fn pool_strcpy(
        &self,
        dst_pool: &Pool,
        src_pool: &Pool,
        dst: usize,
        src: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        self.library_call();
        let Some(d) = self.operand(dst_pool, dst, completeness, site) else {
            return dst;
        };
        let Some(s) = self.operand(src_pool, src, completeness, site) else {
            return dst;
        };
        // SAFETY: bounded reads stay in the object.
        let scanned = unsafe { self.terminated(&s, site) };
        let mut len = scanned.len;
        if len >= d.limit() {
            self.clamped(overflow(&d, len + 1), site);
            len = d.limit() - 1;
        }
        // SAFETY: `len + 1` bytes fit the destination and `len` the source.
        unsafe {
            ptr::copy(src as *const u8, dst as *mut u8, len);
            ptr::write((dst + len) as *mut u8, 0);
        }
        dst
    }

    /// Checked `strncpy`: copies up to `n` bytes and pads with NULs.
    ///
    /// # Safety
    ///
    /// Unbounded operands carry the `strncpy` contract.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn pool_strncpy(
        &self,
        dst_pool: &Pool,
        src_pool: &Pool,
        dst: usize,
        src: usize,
        n: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        if n == 0 {
            return dst;
        }
        self.library_call();
        let Some(d) = self.operand(dst_pool, dst, completeness, site) else {
            return dst;
        };
        let Some(s) = self.operand(src_pool, src, completeness, site) else {
            return dst;
        };
        let readable = n.min(s.limit());
        // SAFETY: `readable` stays in the source object.
        let len = unsafe { scan_nul(src, readable) };
        if len == readable && n > readable {
            self.clamped(overread(&s, n), site);
        }
        let mut total = n;
        if total > d.limit() {
            self.clamped(overflow(&d, n), site);
            total = d.limit();
        }
        let copied = len.min(total);
        // SAFETY: `total` bytes fit the destination and `copied` the source.
        unsafe {
            ptr::copy(src as *const u8, dst as *mut u8, copied);
            ptr::write_bytes((dst + copied) as *mut u8, 0, total - copied);
        }
        dst
    }

    /// Checked `strcat`.
    ///
    /// # Safety
    ///
    /// Unbounded operands carry the `strcat` contract.
    pub unsafe fn pool_strcat(
        &self,
        dst_pool: &Pool,
        src_pool: &Pool,
        dst: usize,
        src: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        // SAFETY: forwarded caller contract.
        unsafe { self.concat(dst_pool, src_pool, dst, src, None, completeness, site) }
    }

    /// Checked `strncat`. The source need not be terminated when `n` bytes
    /// of it fit its object.
    ///
    /// # Safety
    ///
    /// Unbounded operands carry the `strncat` contract.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn pool_strncat(
        &self,
        dst_pool: &Pool,
        src_pool: &Pool,
        dst: usize,
        src: usize,
        n: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        // SAFETY: forwarded caller contract.
        unsafe { self.concat(dst_pool, src_pool, dst, src, Some(n), completeness, site) }
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn concat(
        &self,
        dst_pool: &Pool,
        src_pool: &Pool,
        dst: usize,
        src: usize,
        n: Option<usize>,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        self.library_call();
        let Some(d) = self.operand(dst_pool, dst, completeness, site) else {
            return dst;
        };
        let Some(s) = self.operand(src_pool, src, completeness, site) else {
            return dst;
        };
        // SAFETY: bounded reads stay in the object.
        let head = unsafe { self.terminated(&d, site) };
        if !head.terminated {
            return dst;
        }
        let amount = match n {
            None => {
                // SAFETY: as above.
                unsafe { self.terminated(&s, site) }.len
            }
            Some(n) => {
                let readable = n.min(s.limit());
                // SAFETY: `readable` stays in the source object.
                let len = unsafe { scan_nul(src, readable) };
                if len == readable && n > readable {
                    self.clamped(unterminated(&s), site);
                }
                len
            }
        };
        let room = d.limit() - head.len - 1;
        let appended = if amount > room {
            self.clamped(overflow(&d, head.len + amount + 1), site);
            room
        } else {
            amount
        };
        let tail = dst + head.len;
        // SAFETY: `head.len + appended + 1` bytes fit the destination.
        unsafe {
            ptr::copy(src as *const u8, tail as *mut u8, appended);
            ptr::write((tail + appended) as *mut u8, 0);
        }
        dst
    }

    // -----------------------------------------------------------------------
    // Searches
    // -----------------------------------------------------------------------

    /// Checked `strchr`. Returns the address of the first `c`, or 0. Only
    /// the part of `s` inside its object is searched.
    ///
    /// # Safety
    ///
    /// An unbounded `s` must be NUL-terminated.
    pub unsafe fn pool_strchr(
        &self,
        pool: &Pool,
        s: usize,
        c: u8,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        // SAFETY: forwarded caller contract.
        unsafe { self.search_byte(pool, s, c, completeness, site, false) }
    }

    /// Checked `strrchr`. Returns the address of the last `c`, or 0.
    ///
    /// # Safety
    ///
    /// An unbounded `s` must be NUL-terminated.
    pub unsafe fn pool_strrchr(
        &self,
        pool: &Pool,
        s: usize,
        c: u8,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        // SAFETY: forwarded caller contract.
        unsafe { self.search_byte(pool, s, c, completeness, site, true) }
    }

    unsafe fn search_byte(
        &self,
        pool: &Pool,
        s: usize,
        c: u8,
        completeness: Completeness,
        site: &SourceSite,
        last: bool,
    ) -> usize {
        self.library_call();
        let Some(op) = self.operand(pool, s, completeness, site) else {
            return 0;
        };
        // SAFETY: bounded reads stay in the object.
        let scanned = unsafe { self.terminated(&op, site) };
        if c == 0 {
            return if scanned.terminated { s + scanned.len } else { 0 };
        }
        // SAFETY: `scanned.len` bytes were just read.
        let haystack = unsafe { bytes(s, scanned.len) };
        let found = if last {
            haystack.iter().rposition(|&b| b == c)
        } else {
            haystack.iter().position(|&b| b == c)
        };
        found.map_or(0, |offset| s + offset)
    }

    /// Checked `strstr`. Returns the address of the first occurrence of
    /// `needle` in `haystack`, or 0.
    ///
    /// # Safety
    ///
    /// Unbounded operands must be NUL-terminated.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn pool_strstr(
        &self,
        haystack_pool: &Pool,
        needle_pool: &Pool,
        haystack: usize,
        needle: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        self.library_call();
        let Some(h) = self.operand(haystack_pool, haystack, completeness, site) else {
            return 0;
        };
        let Some(n) = self.operand(needle_pool, needle, completeness, site) else {
            return 0;
        };
        // SAFETY: bounded reads stay in their objects.
        let (h_len, n_len) = unsafe { (self.terminated(&h, site).len, self.terminated(&n, site).len) };
        if n_len == 0 {
            return haystack;
        }
        // SAFETY: both lengths were just read.
        let (hay, pattern) = unsafe { (bytes(haystack, h_len), bytes(needle, n_len)) };
        hay.windows(n_len)
            .position(|window| window == pattern)
            .map_or(0, |offset| haystack + offset)
    }

    /// Checked `strpbrk`. Returns the address of the first byte of `s` that
    /// occurs in `accept`, or 0.
    ///
    /// # Safety
    ///
    /// Unbounded operands must be NUL-terminated.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn pool_strpbrk(
        &self,
        s_pool: &Pool,
        accept_pool: &Pool,
        s: usize,
        accept: usize,
        completeness: Completeness,
        site: &SourceSite,
    ) -> usize {
        self.library_call();
        let Some(op) = self.operand(s_pool, s, completeness, site) else {
            return 0;
        };
        let Some(set) = self.operand(accept_pool, accept, completeness, site) else {
            return 0;
        };
        // SAFETY: bounded reads stay in their objects.
        let (s_len, set_len) =
            unsafe { (self.terminated(&op, site).len, self.terminated(&set, site).len) };
        // SAFETY: both lengths were just read.
        let (text, set) = unsafe { (bytes(s, s_len), bytes(accept, set_len)) };
        text.iter()
            .position(|b| set.contains(b))
            .map_or(0, |offset| s + offset)
    }
}
