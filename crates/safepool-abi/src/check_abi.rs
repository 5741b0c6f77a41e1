//! Check entry points.
//!
//! Each check has a plain form and a `_debug` form taking the instrumented
//! source file and line. Checks that return a pointer hand back the value
//! the program must continue with: the checked pointer itself, or a
//! sentinel standing for an out-of-bounds result.

use std::ffi::{c_char, c_int, c_long, c_uint, c_void};

use safepool_membrane::{Runtime, SourceSite};

use crate::pool_abi::{SafePool, with_pool};
use crate::runtime_state::with_runtime;
use crate::util::debug_site;

// ---------------------------------------------------------------------------
// Load/store checks
// ---------------------------------------------------------------------------

unsafe fn poolcheck(handle: *mut SafePool, ptr: *mut c_void, complete: bool, site: &SourceSite) {
    // SAFETY: forwarded caller contract.
    unsafe {
        with_pool(handle, (), |rt, pool| {
            if complete {
                rt.check_dereference_at(pool, ptr as usize, site);
            } else {
                rt.check_dereference_incomplete_at(pool, ptr as usize, site);
            }
        });
    }
}

/// Dereference check against a pool whose objects are all registered.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolcheck(handle: *mut SafePool, ptr: *mut c_void) {
    // SAFETY: forwarded caller contract.
    unsafe { poolcheck(handle, ptr, true, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolcheck_debug(
    handle: *mut SafePool,
    ptr: *mut c_void,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    unsafe { poolcheck(handle, ptr, true, &debug_site(file, line)) }
}

/// Dereference check that lets unregistered pointers through.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolcheckui(handle: *mut SafePool, ptr: *mut c_void) {
    // SAFETY: forwarded caller contract.
    unsafe { poolcheck(handle, ptr, false, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolcheckui_debug(
    handle: *mut SafePool,
    ptr: *mut c_void,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    unsafe { poolcheck(handle, ptr, false, &debug_site(file, line)) }
}

// ---------------------------------------------------------------------------
// Index checks
// ---------------------------------------------------------------------------

unsafe fn boundscheck(
    handle: *mut SafePool,
    src: *mut c_void,
    dst: *mut c_void,
    complete: bool,
    site: &SourceSite,
) -> *mut c_void {
    let (src, dst) = (src as usize, dst as usize);
    // SAFETY: forwarded caller contract.
    let result = unsafe {
        with_pool(handle, dst, |rt, pool| {
            if complete {
                rt.check_index_at(pool, src, dst, site)
            } else {
                rt.check_index_incomplete_at(pool, src, dst, site)
            }
        })
    };
    result as *mut c_void
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_boundscheck(
    handle: *mut SafePool,
    src: *mut c_void,
    dst: *mut c_void,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { boundscheck(handle, src, dst, true, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_boundscheck_debug(
    handle: *mut SafePool,
    src: *mut c_void,
    dst: *mut c_void,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { boundscheck(handle, src, dst, true, &debug_site(file, line)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_boundscheckui(
    handle: *mut SafePool,
    src: *mut c_void,
    dst: *mut c_void,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { boundscheck(handle, src, dst, false, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_boundscheckui_debug(
    handle: *mut SafePool,
    src: *mut c_void,
    dst: *mut c_void,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { boundscheck(handle, src, dst, false, &debug_site(file, line)) }
}

/// `node` must sit `offset` bytes into its object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolcheckalign(handle: *mut SafePool, node: *mut c_void, offset: usize) {
    // SAFETY: forwarded caller contract.
    unsafe {
        with_pool(handle, (), |rt, pool| {
            rt.check_align_at(pool, node as usize, offset, &SourceSite::UNKNOWN);
        });
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolcheckalign_debug(
    handle: *mut SafePool,
    node: *mut c_void,
    offset: usize,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    // SAFETY: forwarded caller contract.
    unsafe {
        with_pool(handle, (), |rt, pool| rt.check_align_at(pool, node as usize, offset, &site));
    }
}

// ---------------------------------------------------------------------------
// Exact checks
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn safepool_exactcheck(index: c_long, bound: c_long) {
    with_runtime((), |rt| {
        rt.exact_check_at(i64::from(index), i64::from(bound), &SourceSite::UNKNOWN);
    });
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_exactcheck_debug(
    index: c_long,
    bound: c_long,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    with_runtime((), |rt| rt.exact_check_at(i64::from(index), i64::from(bound), &site));
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_exactcheck2(
    base: *mut c_void,
    result: *mut c_void,
    size: usize,
) -> *mut c_void {
    let (base, result) = (base as usize, result as usize);
    with_runtime(result, |rt| {
        rt.exact_check2_at(base, result, size, &SourceSite::UNKNOWN)
    }) as *mut c_void
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_exactcheck2_debug(
    base: *mut c_void,
    result: *mut c_void,
    size: usize,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    let (base, result) = (base as usize, result as usize);
    with_runtime(result, |rt| rt.exact_check2_at(base, result, size, &site)) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_exactcheck2a(
    base: *mut c_void,
    result: *mut c_void,
    size: usize,
) -> *mut c_void {
    let (base, result) = (base as usize, result as usize);
    with_runtime(result, |rt| {
        rt.exact_check2a_at(base, result, size, &SourceSite::UNKNOWN)
    }) as *mut c_void
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_exactcheck2a_debug(
    base: *mut c_void,
    result: *mut c_void,
    size: usize,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    let (base, result) = (base as usize, result as usize);
    with_runtime(result, |rt| rt.exact_check2a_at(base, result, size, &site)) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_exactcheck3(
    base: *mut c_void,
    result: *mut c_void,
    end: *mut c_void,
) -> *mut c_void {
    let (base, result, end) = (base as usize, result as usize, end as usize);
    with_runtime(result, |rt| {
        rt.exact_check3_at(base, result, end, &SourceSite::UNKNOWN)
    }) as *mut c_void
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_exactcheck3_debug(
    base: *mut c_void,
    result: *mut c_void,
    end: *mut c_void,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    let (base, result, end) = (base as usize, result as usize, end as usize);
    with_runtime(result, |rt| rt.exact_check3_at(base, result, end, &site)) as *mut c_void
}

// ---------------------------------------------------------------------------
// Indirect calls
// ---------------------------------------------------------------------------

unsafe fn funccheck(target: *const c_void, candidates: *const *const c_void, count: usize, site: &SourceSite) {
    let targets: Vec<usize> = if candidates.is_null() || count == 0 {
        Vec::new()
    } else {
        // SAFETY: the caller passes an array of `count` function pointers.
        unsafe { std::slice::from_raw_parts(candidates, count) }
            .iter()
            .map(|candidate| *candidate as usize)
            .collect()
    };
    with_runtime((), |rt| rt.function_pointer_check_at(target as usize, &targets, site));
}

/// `target` must be one of the `count` function pointers at `candidates`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_funccheck(
    target: *const c_void,
    candidates: *const *const c_void,
    count: usize,
) {
    // SAFETY: forwarded caller contract.
    unsafe { funccheck(target, candidates, count, &SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_funccheck_debug(
    target: *const c_void,
    candidates: *const *const c_void,
    count: usize,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    unsafe { funccheck(target, candidates, count, &debug_site(file, line)) }
}

// ---------------------------------------------------------------------------
// Rewritten pointers and reporting
// ---------------------------------------------------------------------------

/// The pointer a sentinel stands for. Other values pass through unchanged.
#[unsafe(no_mangle)]
pub extern "C" fn safepool_get_actual_val(ptr: *mut c_void) -> *mut c_void {
    let addr = ptr as usize;
    with_runtime(addr, |rt| rt.get_original_value(addr)) as *mut c_void
}

/// Non-zero if `ptr` is a sentinel.
#[unsafe(no_mangle)]
pub extern "C" fn safepool_is_rewritten(ptr: *const c_void) -> c_int {
    with_runtime(0, |rt| c_int::from(rt.is_sentinel(ptr as usize)))
}

/// Fold traps taken by the fault handler into the report history. Returns
/// how many were folded.
#[unsafe(no_mangle)]
pub extern "C" fn safepool_sync_traps() -> usize {
    with_runtime(0, Runtime::sync_traps)
}

/// Violations reported since startup.
#[unsafe(no_mangle)]
pub extern "C" fn safepool_violation_count() -> u64 {
    with_runtime(0, |rt| rt.metrics().total_violations())
}
