//! Checked `<string.h>` entry points.
//!
//! Each call names the pool of every pointer operand. Operands are bounded
//! by their pool object or an external object; overlong calls are reported
//! and shortened to fit. When the runtime or a pool handle is unavailable the
//! plain libc routine runs instead.
//!
//! The string routines take a `complete` flag (nonzero when every object the
//! operands can point to is registered) and have `_debug` forms carrying the
//! source file and line.

use std::ffi::{c_char, c_int, c_uchar, c_uint, c_void};

use safepool_membrane::{Completeness, SourceSite};

use crate::pool_abi::{SafePool, with_pool, with_pool_pair};
use crate::util::{completeness, debug_site};

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_memcpy(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_void,
    src: *const c_void,
    n: usize,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool_pair(dst_pool, src_pool, |rt, d, s| {
            rt.pool_memcpy(d, s, dst as usize, src as usize, n, Completeness::Complete, &SourceSite::UNKNOWN)
        })
    };
    match checked {
        Some(_) => dst,
        // SAFETY: unchecked fallback under the libc contract.
        None => unsafe { libc::memcpy(dst, src, n) },
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_memmove(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_void,
    src: *const c_void,
    n: usize,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool_pair(dst_pool, src_pool, |rt, d, s| {
            rt.pool_memmove(d, s, dst as usize, src as usize, n, Completeness::Complete, &SourceSite::UNKNOWN)
        })
    };
    match checked {
        Some(_) => dst,
        // SAFETY: unchecked fallback under the libc contract.
        None => unsafe { libc::memmove(dst, src, n) },
    }
}

/// Like `memcpy`, but returns the address after the last byte written.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_mempcpy(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_void,
    src: *const c_void,
    n: usize,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool_pair(dst_pool, src_pool, |rt, d, s| {
            rt.pool_mempcpy(d, s, dst as usize, src as usize, n, Completeness::Complete, &SourceSite::UNKNOWN)
        })
    };
    match checked {
        Some(end) => end as *mut c_void,
        // SAFETY: unchecked fallback under the libc contract.
        None => unsafe { libc::memcpy(dst, src, n).cast::<u8>().add(n).cast() },
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_memset(
    pool: *mut SafePool,
    dst: *mut c_void,
    c: c_int,
    n: usize,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool(pool, None, |rt, pool| {
            Some(rt.pool_memset(pool, dst as usize, c as u8, n, Completeness::Complete, &SourceSite::UNKNOWN))
        })
    };
    match checked {
        Some(_) => dst,
        // SAFETY: unchecked fallback under the libc contract.
        None => unsafe { libc::memset(dst, c, n) },
    }
}

// ---------------------------------------------------------------------------
// Lengths
// ---------------------------------------------------------------------------

unsafe fn strlen_at(pool: *mut SafePool, s: *const c_char, complete: c_uchar, site: &SourceSite) -> usize {
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool(pool, None, |rt, pool| Some(rt.pool_strlen(pool, s as usize, completeness(complete), site)))
    };
    // SAFETY: unchecked fallback under the libc contract.
    checked.unwrap_or_else(|| unsafe { libc::strlen(s) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strlen(pool: *mut SafePool, s: *const c_char, complete: c_uchar) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { strlen_at(pool, s, complete, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strlen_debug(
    pool: *mut SafePool,
    s: *const c_char,
    complete: c_uchar,
    file: *const c_char,
    line: c_uint,
) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { strlen_at(pool, s, complete, &debug_site(file, line)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strnlen(pool: *mut SafePool, s: *const c_char, maxlen: usize) -> usize {
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool(pool, None, |rt, pool| {
            Some(rt.pool_strnlen(pool, s as usize, maxlen, Completeness::Complete, &SourceSite::UNKNOWN))
        })
    };
    // SAFETY: unchecked fallback under the libc contract.
    checked.unwrap_or_else(|| unsafe { libc::strnlen(s, maxlen) })
}

// ---------------------------------------------------------------------------
// Copies
// ---------------------------------------------------------------------------

unsafe fn strcpy_at(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_char,
    src: *const c_char,
    complete: c_uchar,
    site: &SourceSite,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool_pair(dst_pool, src_pool, |rt, d, s| {
            rt.pool_strcpy(d, s, dst as usize, src as usize, completeness(complete), site)
        })
    };
    match checked {
        Some(_) => dst,
        // SAFETY: unchecked fallback under the libc contract.
        None => unsafe { libc::strcpy(dst, src) },
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strcpy(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_char,
    src: *const c_char,
    complete: c_uchar,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strcpy_at(dst_pool, src_pool, dst, src, complete, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strcpy_debug(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_char,
    src: *const c_char,
    complete: c_uchar,
    file: *const c_char,
    line: c_uint,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strcpy_at(dst_pool, src_pool, dst, src, complete, &debug_site(file, line)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strncpy(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_char,
    src: *const c_char,
    n: usize,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool_pair(dst_pool, src_pool, |rt, d, s| {
            rt.pool_strncpy(d, s, dst as usize, src as usize, n, Completeness::Complete, &SourceSite::UNKNOWN)
        })
    };
    match checked {
        Some(_) => dst,
        // SAFETY: unchecked fallback under the libc contract.
        None => unsafe { libc::strncpy(dst, src, n) },
    }
}

unsafe fn strcat_at(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_char,
    src: *const c_char,
    n: Option<usize>,
    complete: c_uchar,
    site: &SourceSite,
) -> *mut c_char {
    let completeness = completeness(complete);
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool_pair(dst_pool, src_pool, |rt, d, s| match n {
            Some(n) => rt.pool_strncat(d, s, dst as usize, src as usize, n, completeness, site),
            None => rt.pool_strcat(d, s, dst as usize, src as usize, completeness, site),
        })
    };
    match (checked, n) {
        (Some(_), _) => dst,
        // SAFETY: unchecked fallback under the libc contract.
        (None, Some(n)) => unsafe { libc::strncat(dst, src, n) },
        // SAFETY: as above.
        (None, None) => unsafe { libc::strcat(dst, src) },
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strcat(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_char,
    src: *const c_char,
    complete: c_uchar,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strcat_at(dst_pool, src_pool, dst, src, None, complete, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strcat_debug(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_char,
    src: *const c_char,
    complete: c_uchar,
    file: *const c_char,
    line: c_uint,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strcat_at(dst_pool, src_pool, dst, src, None, complete, &debug_site(file, line)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strncat(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_char,
    src: *const c_char,
    n: usize,
    complete: c_uchar,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strcat_at(dst_pool, src_pool, dst, src, Some(n), complete, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strncat_debug(
    dst_pool: *mut SafePool,
    src_pool: *mut SafePool,
    dst: *mut c_char,
    src: *const c_char,
    n: usize,
    complete: c_uchar,
    file: *const c_char,
    line: c_uint,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strcat_at(dst_pool, src_pool, dst, src, Some(n), complete, &debug_site(file, line)) }
}

// ---------------------------------------------------------------------------
// Searches
// ---------------------------------------------------------------------------

unsafe fn strchr_at(
    pool: *mut SafePool,
    s: *const c_char,
    c: c_int,
    complete: c_uchar,
    last: bool,
    site: &SourceSite,
) -> *mut c_char {
    let completeness = completeness(complete);
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool(pool, None, |rt, pool| {
            Some(if last {
                rt.pool_strrchr(pool, s as usize, c as u8, completeness, site)
            } else {
                rt.pool_strchr(pool, s as usize, c as u8, completeness, site)
            })
        })
    };
    match checked {
        Some(found) => found as *mut c_char,
        // SAFETY: unchecked fallback under the libc contract.
        None if last => unsafe { libc::strrchr(s, c) },
        // SAFETY: as above.
        None => unsafe { libc::strchr(s, c) },
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strchr(
    pool: *mut SafePool,
    s: *const c_char,
    c: c_int,
    complete: c_uchar,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strchr_at(pool, s, c, complete, false, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strchr_debug(
    pool: *mut SafePool,
    s: *const c_char,
    c: c_int,
    complete: c_uchar,
    file: *const c_char,
    line: c_uint,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strchr_at(pool, s, c, complete, false, &debug_site(file, line)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strrchr(
    pool: *mut SafePool,
    s: *const c_char,
    c: c_int,
    complete: c_uchar,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strchr_at(pool, s, c, complete, true, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strrchr_debug(
    pool: *mut SafePool,
    s: *const c_char,
    c: c_int,
    complete: c_uchar,
    file: *const c_char,
    line: c_uint,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { strchr_at(pool, s, c, complete, true, &debug_site(file, line)) }
}

/// Which two-string search to run.
#[derive(Clone, Copy)]
enum Search {
    Substring,
    AnyOf,
}

unsafe fn search_at(
    s_pool: *mut SafePool,
    t_pool: *mut SafePool,
    s: *const c_char,
    t: *const c_char,
    complete: c_uchar,
    search: Search,
    site: &SourceSite,
) -> *mut c_char {
    let completeness = completeness(complete);
    // SAFETY: forwarded caller contract.
    let checked = unsafe {
        with_pool_pair(s_pool, t_pool, |rt, sp, tp| match search {
            Search::Substring => rt.pool_strstr(sp, tp, s as usize, t as usize, completeness, site),
            Search::AnyOf => rt.pool_strpbrk(sp, tp, s as usize, t as usize, completeness, site),
        })
    };
    match (checked, search) {
        (Some(found), _) => found as *mut c_char,
        // SAFETY: unchecked fallback under the libc contract.
        (None, Search::Substring) => unsafe { libc::strstr(s, t) },
        // SAFETY: as above.
        (None, Search::AnyOf) => unsafe { libc::strpbrk(s, t) },
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strstr(
    haystack_pool: *mut SafePool,
    needle_pool: *mut SafePool,
    haystack: *const c_char,
    needle: *const c_char,
    complete: c_uchar,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe {
        search_at(haystack_pool, needle_pool, haystack, needle, complete, Search::Substring, &SourceSite::UNKNOWN)
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strstr_debug(
    haystack_pool: *mut SafePool,
    needle_pool: *mut SafePool,
    haystack: *const c_char,
    needle: *const c_char,
    complete: c_uchar,
    file: *const c_char,
    line: c_uint,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe {
        search_at(haystack_pool, needle_pool, haystack, needle, complete, Search::Substring, &debug_site(file, line))
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strpbrk(
    s_pool: *mut SafePool,
    accept_pool: *mut SafePool,
    s: *const c_char,
    accept: *const c_char,
    complete: c_uchar,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { search_at(s_pool, accept_pool, s, accept, complete, Search::AnyOf, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_strpbrk_debug(
    s_pool: *mut SafePool,
    accept_pool: *mut SafePool,
    s: *const c_char,
    accept: *const c_char,
    complete: c_uchar,
    file: *const c_char,
    line: c_uint,
) -> *mut c_char {
    // SAFETY: forwarded caller contract.
    unsafe { search_at(s_pool, accept_pool, s, accept, complete, Search::AnyOf, &debug_site(file, line)) }
}
