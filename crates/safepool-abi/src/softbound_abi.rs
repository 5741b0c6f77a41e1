//! Entry points of the pointer-metadata backend.
//!
//! Naming follows the shadow-stack calling convention: a caller allocates a
//! frame for its pointer arguments, stores their metadata by argument
//! number, and the callee loads them before the caller deallocates.

use std::ffi::{c_char, c_uint, c_void};

use safepool_membrane::{Access, Field, KeyLock, PointerMetadata, Runtime, SourceSite};

use crate::runtime_state::{global_runtime, with_runtime};
use crate::util::debug_site;

/// C view of one metadata tuple.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafepoolMetadata {
    pub base: *mut c_void,
    pub bound: *mut c_void,
    pub key: usize,
    pub lock: *mut c_void,
}

impl From<PointerMetadata> for SafepoolMetadata {
    fn from(meta: PointerMetadata) -> Self {
        Self {
            base: meta.base as *mut c_void,
            bound: meta.bound as *mut c_void,
            key: meta.key,
            lock: meta.lock as *mut c_void,
        }
    }
}

/// Write a key/lock pair through optional out-pointers.
///
/// # Safety
///
/// Each pointer must be null or valid for a write.
unsafe fn write_pair(pair: KeyLock, key_out: *mut usize, lock_out: *mut *mut c_void) {
    // SAFETY: per the caller contract.
    unsafe {
        if let Some(key) = key_out.as_mut() {
            *key = pair.key;
        }
        if let Some(lock) = lock_out.as_mut() {
            *lock = pair.lock as *mut c_void;
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata trie
// ---------------------------------------------------------------------------

/// Record the metadata of the pointer stored at `slot`.
#[unsafe(no_mangle)]
pub extern "C" fn safepool_metadata_store(
    slot: *mut c_void,
    base: *mut c_void,
    bound: *mut c_void,
    key: usize,
    lock: *mut c_void,
) {
    let meta = PointerMetadata {
        base: base as usize,
        bound: bound as usize,
        key,
        lock: lock as usize,
    };
    with_runtime((), |rt| rt.metadata_store(slot as usize, meta));
}

/// Load the metadata of the pointer stored at `slot` into `out`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_metadata_load(slot: *const c_void, out: *mut SafepoolMetadata) {
    let meta = with_runtime(PointerMetadata::default(), |rt| rt.metadata_load(slot as usize));
    // SAFETY: `out` is null or points to writable storage for one tuple.
    if let Some(out) = unsafe { out.as_mut() } {
        *out = meta.into();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_metadata_load_base(slot: *const c_void) -> *mut c_void {
    with_runtime(0, |rt| rt.metadata_load(slot as usize).base) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_metadata_load_bound(slot: *const c_void) -> *mut c_void {
    with_runtime(0, |rt| rt.metadata_load(slot as usize).bound) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_metadata_load_key(slot: *const c_void) -> usize {
    with_runtime(0, |rt| rt.metadata_load(slot as usize).key)
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_metadata_load_lock(slot: *const c_void) -> *mut c_void {
    with_runtime(0, |rt| rt.metadata_load(slot as usize).lock) as *mut c_void
}

/// Duplicate slot metadata for a `memcpy` of `size` bytes.
#[unsafe(no_mangle)]
pub extern "C" fn safepool_copy_metadata(dest: *mut c_void, from: *const c_void, size: usize) {
    with_runtime((), |rt| rt.copy_metadata(dest as usize, from as usize, size));
}

// ---------------------------------------------------------------------------
// Dereference checks
// ---------------------------------------------------------------------------

fn spatial(
    access: Access,
    base: *mut c_void,
    bound: *mut c_void,
    ptr: *mut c_void,
    size: usize,
    site: &SourceSite,
) {
    with_runtime((), |rt| {
        rt.spatial_check_at(access, base as usize, bound as usize, ptr as usize, size, site);
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_spatial_load_check(
    base: *mut c_void,
    bound: *mut c_void,
    ptr: *mut c_void,
    size: usize,
) {
    spatial(Access::Load, base, bound, ptr, size, &SourceSite::UNKNOWN);
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_spatial_store_check(
    base: *mut c_void,
    bound: *mut c_void,
    ptr: *mut c_void,
    size: usize,
) {
    spatial(Access::Store, base, bound, ptr, size, &SourceSite::UNKNOWN);
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_spatial_load_check_debug(
    base: *mut c_void,
    bound: *mut c_void,
    ptr: *mut c_void,
    size: usize,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    spatial(Access::Load, base, bound, ptr, size, &site);
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_spatial_store_check_debug(
    base: *mut c_void,
    bound: *mut c_void,
    ptr: *mut c_void,
    size: usize,
    file: *const c_char,
    line: c_uint,
) {
    // SAFETY: forwarded caller contract.
    let site = unsafe { debug_site(file, line) };
    spatial(Access::Store, base, bound, ptr, size, &site);
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_temporal_load_check(key: usize, lock: *mut c_void) {
    with_runtime((), |rt| {
        rt.temporal_check_at(Access::Load, key, lock as usize, &SourceSite::UNKNOWN);
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_temporal_store_check(key: usize, lock: *mut c_void) {
    with_runtime((), |rt| {
        rt.temporal_check_at(Access::Store, key, lock as usize, &SourceSite::UNKNOWN);
    });
}

/// An indirect call through `ptr` must target the start of its function.
#[unsafe(no_mangle)]
pub extern "C" fn safepool_call_dereference_check(
    base: *mut c_void,
    bound: *mut c_void,
    ptr: *mut c_void,
) {
    with_runtime((), |rt| {
        rt.call_dereference_check_at(base as usize, bound as usize, ptr as usize, &SourceSite::UNKNOWN);
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_memcopy_check(
    dest: *mut c_void,
    src: *const c_void,
    dest_base: *mut c_void,
    dest_bound: *mut c_void,
    src_base: *mut c_void,
    src_bound: *mut c_void,
    size: usize,
) {
    let dest = (dest as usize, dest_base as usize, dest_bound as usize);
    let src = (src as usize, src_base as usize, src_bound as usize);
    with_runtime((), |rt| rt.memcopy_check_at(dest, src, size, &SourceSite::UNKNOWN));
}

// ---------------------------------------------------------------------------
// Shadow stack
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn safepool_allocate_shadow_stack_space(args: usize) {
    with_runtime((), |rt| rt.shadow_stack_allocate(args));
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_deallocate_shadow_stack_space() {
    with_runtime((), Runtime::shadow_stack_deallocate);
}

fn store_field(arg: usize, field: Field, value: usize) {
    with_runtime((), |rt| rt.shadow_stack_store(arg, field, value));
}

fn load_field(arg: usize, field: Field) -> usize {
    with_runtime(0, |rt| rt.shadow_stack_load(arg, field))
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_store_base_shadow_stack(base: *mut c_void, arg: usize) {
    store_field(arg, Field::Base, base as usize);
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_store_bound_shadow_stack(bound: *mut c_void, arg: usize) {
    store_field(arg, Field::Bound, bound as usize);
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_store_key_shadow_stack(key: usize, arg: usize) {
    store_field(arg, Field::Key, key);
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_store_lock_shadow_stack(lock: *mut c_void, arg: usize) {
    store_field(arg, Field::Lock, lock as usize);
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_load_base_shadow_stack(arg: usize) -> *mut c_void {
    load_field(arg, Field::Base) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_load_bound_shadow_stack(arg: usize) -> *mut c_void {
    load_field(arg, Field::Bound) as *mut c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_load_key_shadow_stack(arg: usize) -> usize {
    load_field(arg, Field::Key)
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_load_lock_shadow_stack(arg: usize) -> *mut c_void {
    load_field(arg, Field::Lock) as *mut c_void
}

// ---------------------------------------------------------------------------
// Keys and locks
// ---------------------------------------------------------------------------

/// Lock holding the global key.
#[unsafe(no_mangle)]
pub extern "C" fn safepool_global_lock() -> *mut c_void {
    with_runtime(0, Runtime::global_lock) as *mut c_void
}

/// Mint a key and lock for the frame being entered.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_stack_memory_allocation(key_out: *mut usize, lock_out: *mut *mut c_void) {
    if let Some(rt) = global_runtime() {
        let pair = rt.stack_memory_allocation();
        // SAFETY: forwarded caller contract.
        unsafe { write_pair(pair, key_out, lock_out) };
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn safepool_stack_memory_deallocation() {
    with_runtime((), Runtime::stack_memory_deallocation);
}

/// Mint a key and lock for heap object `ptr`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn safepool_heap_memory_allocation(
    ptr: *mut c_void,
    key_out: *mut usize,
    lock_out: *mut *mut c_void,
) {
    if let Some(rt) = global_runtime() {
        let pair = rt.heap_memory_allocation(ptr as usize);
        // SAFETY: forwarded caller contract.
        unsafe { write_pair(pair, key_out, lock_out) };
    }
}

/// Retire the lock of heap object `ptr`.
#[unsafe(no_mangle)]
pub extern "C" fn safepool_memory_deallocation(ptr: *mut c_void, key: usize, lock: *mut c_void) {
    with_runtime((), |rt| {
        rt.memory_deallocation_at(ptr as usize, key, lock as usize, &SourceSite::UNKNOWN);
    });
}
