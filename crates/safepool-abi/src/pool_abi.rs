//! Pool allocation entry points.
//!
//! A pool is handed to C as an opaque `SafePool *`. Instrumented programs are
//! expected to serialize use of one pool; the mutex only keeps a misbehaving
//! program from corrupting the allocator.

use std::ffi::{CStr, c_char, c_int, c_uint, c_void};

use parking_lot::Mutex;
use safepool_membrane::{Pool, Runtime, SourceSite};

use crate::runtime_state::global_runtime;
use crate::util::{debug_site, set_errno};

/// Opaque pool handle.
pub struct SafePool {
    pool: Mutex<Pool>,
}

/// Run `f` on the runtime and the pool behind `handle`, or return
/// `fallback` when either is unavailable.
///
/// # Safety
///
/// `handle` must be null or a live handle from [`safepool_poolinit`].
pub(crate) unsafe fn with_pool<T>(
    handle: *mut SafePool,
    fallback: T,
    f: impl FnOnce(&'static Runtime, &mut Pool) -> T,
) -> T {
    let Some(runtime) = global_runtime() else {
        return fallback;
    };
    // SAFETY: per the caller contract.
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return fallback;
    };
    let mut pool = handle.pool.lock();
    f(runtime, &mut pool)
}

/// Run `f` on the runtime and the pools behind two handles, or return `None`
/// when the runtime or either handle is unavailable. The same handle may be
/// passed twice; distinct handles are locked in address order.
///
/// # Safety
///
/// Both handles must be null or live handles from [`safepool_poolinit`].
pub(crate) unsafe fn with_pool_pair<T>(
    first: *mut SafePool,
    second: *mut SafePool,
    f: impl FnOnce(&'static Runtime, &Pool, &Pool) -> T,
) -> Option<T> {
    let runtime = global_runtime()?;
    // SAFETY: per the caller contract.
    let (a, b) = unsafe { (first.as_ref()?, second.as_ref()?) };
    if std::ptr::eq(a, b) {
        let pool = a.pool.lock();
        return Some(f(runtime, &*pool, &*pool));
    }
    let a_first = std::ptr::from_ref(a) < std::ptr::from_ref(b);
    let (lo, hi) = if a_first { (a, b) } else { (b, a) };
    let lo = lo.pool.lock();
    let hi = hi.pool.lock();
    let (pa, pb): (&Pool, &Pool) = if a_first { (&*lo, &*hi) } else { (&*hi, &*lo) };
    Some(f(runtime, pa, pb))
}

fn to_ptr(addr: Option<usize>) -> *mut c_void {
    addr.map_or(std::ptr::null_mut(), |addr| addr as *mut c_void)
}

/// Like [`to_ptr`], but a failed allocation also sets `errno` to `ENOMEM`.
fn alloc_ptr(addr: Option<usize>) -> *mut c_void {
    if addr.is_none() {
        set_errno(libc::ENOMEM);
    }
    to_ptr(addr)
}

/// `realloc(p, 0)` frees and returns null without touching `errno`.
fn realloc_ptr(addr: Option<usize>, size: usize) -> *mut c_void {
    if size == 0 { to_ptr(addr) } else { alloc_ptr(addr) }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Create a pool for objects of `node_size` bytes. Null if the runtime could
/// not be initialized.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolinit(node_size: c_uint) -> *mut SafePool {
    let Some(runtime) = global_runtime() else {
        return std::ptr::null_mut();
    };
    let pool = runtime.pool_init(node_size as usize);
    Box::into_raw(Box::new(SafePool {
        pool: Mutex::new(pool),
    }))
}

/// Release a pool and everything allocated from it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_pooldestroy(handle: *mut SafePool) {
    if handle.is_null() {
        return;
    }
    // SAFETY: non-null handles come from `safepool_poolinit` and are
    // destroyed at most once.
    let handle = unsafe { Box::from_raw(handle) };
    let pool = handle.pool.into_inner();
    match global_runtime() {
        Some(runtime) => {
            let _ = runtime.pool_destroy(pool);
        }
        None => drop(pool),
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolalloc(handle: *mut SafePool, size: usize) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { alloc_at(handle, size, SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolalloc_debug(
    handle: *mut SafePool,
    size: usize,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { alloc_at(handle, size, debug_site(file, line)) }
}

unsafe fn alloc_at(handle: *mut SafePool, size: usize, site: SourceSite) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let addr = unsafe { with_pool(handle, None, |rt, pool| rt.pool_alloc_at(pool, size, site)) };
    alloc_ptr(addr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolcalloc(
    handle: *mut SafePool,
    count: usize,
    size: usize,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let addr = unsafe {
        with_pool(handle, None, |rt, pool| {
            rt.pool_calloc_at(pool, count, size, SourceSite::UNKNOWN)
        })
    };
    alloc_ptr(addr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolcalloc_debug(
    handle: *mut SafePool,
    count: usize,
    size: usize,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    // SAFETY: forwarded caller contract.
    let addr = unsafe { with_pool(handle, None, |rt, pool| rt.pool_calloc_at(pool, count, size, site)) };
    alloc_ptr(addr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolrealloc(
    handle: *mut SafePool,
    ptr: *mut c_void,
    size: usize,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let addr = unsafe {
        with_pool(handle, None, |rt, pool| {
            rt.pool_realloc_at(pool, ptr as usize, size, SourceSite::UNKNOWN)
        })
    };
    realloc_ptr(addr, size)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolrealloc_debug(
    handle: *mut SafePool,
    ptr: *mut c_void,
    size: usize,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    // SAFETY: forwarded caller contract.
    let addr = unsafe {
        with_pool(handle, None, |rt, pool| rt.pool_realloc_at(pool, ptr as usize, size, site))
    };
    realloc_ptr(addr, size)
}

/// Copy a NUL-terminated string into the pool. Null in, null out.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolstrdup(handle: *mut SafePool, text: *const c_char) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { strdup_at(handle, text, SourceSite::UNKNOWN) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolstrdup_debug(
    handle: *mut SafePool,
    text: *const c_char,
    file: *const c_char,
    line: c_uint,
) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { strdup_at(handle, text, debug_site(file, line)) }
}

unsafe fn strdup_at(
    handle: *mut SafePool,
    text: *const c_char,
    site: SourceSite,
) -> *mut c_void {
    if text.is_null() {
        return std::ptr::null_mut();
    }
    // SAFETY: non-null C strings from the program are NUL-terminated.
    let text = unsafe { CStr::from_ptr(text) };
    // SAFETY: forwarded caller contract.
    let addr = unsafe { with_pool(handle, None, |rt, pool| rt.pool_strdup_at(pool, text, site)) };
    alloc_ptr(addr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolfree(handle: *mut SafePool, ptr: *mut c_void) {
    // SAFETY: forwarded caller contract.
    unsafe {
        with_pool(handle, (), |rt, pool| {
            rt.pool_free_at(pool, ptr as usize, SourceSite::UNKNOWN);
        });
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolfree_debug(
    handle: *mut SafePool,
    ptr: *mut c_void,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    // SAFETY: forwarded caller contract.
    unsafe { with_pool(handle, (), |rt, pool| rt.pool_free_at(pool, ptr as usize, site)) };
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register a global or stack object with the pool.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolregister(handle: *mut SafePool, ptr: *mut c_void, len: usize) {
    // SAFETY: forwarded caller contract.
    unsafe { with_pool(handle, (), |rt, pool| rt.pool_register(pool, ptr as usize, len)) };
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_poolunregister(handle: *mut SafePool, ptr: *mut c_void) -> c_int {
    // SAFETY: forwarded caller contract.
    let removed = unsafe { with_pool(handle, false, |rt, pool| rt.pool_unregister(pool, ptr as usize)) };
    c_int::from(removed)
}

/// Register an object allocated outside every pool (for example by libc).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_register_external(ptr: *mut c_void, len: usize) {
    if let Some(runtime) = global_runtime() {
        runtime.register_external(ptr as usize, len);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_unregister_external(ptr: *mut c_void) -> c_int {
    global_runtime().map_or(0, |runtime| c_int::from(runtime.unregister_external(ptr as usize)))
}

// ---------------------------------------------------------------------------
// Stack frames
// ---------------------------------------------------------------------------

/// Open a stack frame in the pool. Returns 0 on success, -1 on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_newstack(handle: *mut SafePool) -> c_int {
    // SAFETY: forwarded caller contract.
    let opened = unsafe { with_pool(handle, false, |rt, pool| rt.pool_newstack(pool).is_ok()) };
    if opened { 0 } else { -1 }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_alloca(handle: *mut SafePool, size: usize) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    let addr = unsafe {
        with_pool(handle, None, |rt, pool| rt.pool_alloca_at(pool, size, SourceSite::UNKNOWN))
    };
    alloc_ptr(addr)
}

/// Close the innermost stack frame. Returns the number of objects released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_delstack(handle: *mut SafePool) -> usize {
    // SAFETY: forwarded caller contract.
    unsafe { with_pool(handle, 0, |rt, pool| rt.pool_delstack(pool)) }
}
