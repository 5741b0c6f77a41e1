//! Checked `<string.h>` entry points against pool and external operands.

use std::ffi::{CStr, c_char, c_void};
use std::ptr;
use std::sync::{Mutex, MutexGuard, Once};

use safepool_abi::cstdlib_abi::{
    safepool_memcpy, safepool_mempcpy, safepool_memset, safepool_strcat, safepool_strchr,
    safepool_strcpy, safepool_strcpy_debug, safepool_strlen, safepool_strncat, safepool_strnlen,
    safepool_strpbrk, safepool_strrchr, safepool_strstr,
};
use safepool_abi::pool_abi::{
    safepool_poolalloc, safepool_pooldestroy, safepool_poolinit, safepool_register_external,
    safepool_unregister_external,
};
use safepool_abi::runtime_state::global_runtime;
use safepool_membrane::ViolationKind;

static INIT: Once = Once::new();
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn setup() -> MutexGuard<'static, ()> {
    INIT.call_once(|| {
        // SAFETY: runs once, before any test reads the environment.
        unsafe {
            std::env::set_var("SAFEPOOL_MODE", "diagnostic");
            std::env::set_var("SAFEPOOL_DANGLING", "0");
        }
        let runtime = global_runtime().expect("runtime");
        assert!(!runtime.config().mode.terminates());
    });
    let guard = TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(runtime) = global_runtime() {
        runtime.drain_violations();
    }
    guard
}

fn reported() -> Vec<ViolationKind> {
    global_runtime()
        .expect("runtime")
        .drain_violations()
        .into_iter()
        .map(|v| v.kind)
        .collect()
}

/// Allocate `len` bytes and copy `init` into them.
unsafe fn object(pool: *mut safepool_abi::SafePool, len: usize, init: &[u8]) -> *mut c_char {
    // SAFETY: the handle is live and `init` fits the fresh object.
    unsafe {
        let p = safepool_poolalloc(pool, len).cast::<u8>();
        assert!(!p.is_null());
        ptr::copy_nonoverlapping(init.as_ptr(), p, init.len());
        p.cast()
    }
}

unsafe fn text<'a>(p: *const c_char) -> &'a [u8] {
    // SAFETY: callers pass terminated strings.
    unsafe { CStr::from_ptr(p) }.to_bytes()
}

#[test]
fn memcpy_overrun_is_reported_and_clamped() {
    let _guard = setup();
    // SAFETY: operands are pool objects from the entry points.
    unsafe {
        let pool = safepool_poolinit(16);
        let src = object(pool, 8, b"abcdefgh").cast::<c_void>();
        let dst = object(pool, 4, &[0; 4]).cast::<c_void>();

        assert_eq!(safepool_memcpy(pool, pool, dst, src, 4), dst);
        assert!(reported().is_empty());

        assert_eq!(safepool_memcpy(pool, pool, dst, src, 8), dst);
        assert_eq!(reported(), vec![ViolationKind::WriteOutOfBounds]);
        assert_eq!(std::slice::from_raw_parts(dst.cast::<u8>(), 4), b"abcd");

        let end = safepool_mempcpy(pool, pool, dst, src, 2);
        assert_eq!(end as usize, dst as usize + 2);

        safepool_memset(pool, dst, 0, 64);
        assert_eq!(reported(), vec![ViolationKind::WriteOutOfBounds]);
        safepool_pooldestroy(pool);
    }
}

#[test]
fn string_copies_between_two_pools() {
    let _guard = setup();
    // SAFETY: operands are pool objects from the entry points.
    unsafe {
        let small = safepool_poolinit(16);
        let large = safepool_poolinit(64);
        let src = object(large, 32, b"a rather long string\0");
        let dst = object(small, 8, &[0; 8]);

        assert_eq!(safepool_strlen(large, src, 1), 20);
        assert_eq!(safepool_strnlen(large, src, 5), 5);

        assert_eq!(safepool_strcpy(small, large, dst, src, 1), dst);
        assert_eq!(text(dst), b"a rathe");
        assert_eq!(reported(), vec![ViolationKind::WriteOutOfBounds]);

        let short = object(large, 4, b"xy\0");
        safepool_strcpy_debug(small, large, dst, short, 1, c"copy.c".as_ptr(), 9);
        safepool_strcat(small, large, dst, short, 1);
        safepool_strncat(small, large, dst, src, 1, 1);
        assert_eq!(text(dst), b"xyxya");
        assert!(reported().is_empty());

        safepool_pooldestroy(small);
        safepool_pooldestroy(large);
    }
}

#[test]
fn searches_return_addresses_inside_the_operand() {
    let _guard = setup();
    // SAFETY: operands are pool objects from the entry points.
    unsafe {
        let pool = safepool_poolinit(16);
        let s = object(pool, 16, b"key=value;end\0");
        let needle = object(pool, 4, b"val\0");
        let stops = object(pool, 4, b";=\0");

        assert_eq!(safepool_strchr(pool, s, i32::from(b'='), 1), s.add(3));
        assert_eq!(safepool_strrchr(pool, s, i32::from(b'e'), 1), s.add(10));
        assert!(safepool_strchr(pool, s, i32::from(b'#'), 1).is_null());
        assert_eq!(safepool_strstr(pool, pool, s, needle, 1), s.add(4));
        assert_eq!(safepool_strpbrk(pool, pool, s, stops, 1), s.add(3));
        assert!(reported().is_empty());
        safepool_pooldestroy(pool);
    }
}

#[test]
fn external_operands_and_completeness() {
    let _guard = setup();
    let mut buf = *b"outside\0tail";
    let b = buf.as_mut_ptr().cast::<c_char>();
    // SAFETY: `buf` outlives every call below.
    unsafe {
        let pool = safepool_poolinit(16);
        safepool_register_external(b.cast(), buf.len());
        assert_eq!(safepool_strlen(pool, b, 1), 7);
        // Unterminated tail: the scan stops at the end of the buffer.
        assert_eq!(safepool_strlen(pool, b.add(8), 1), 4);
        assert_eq!(reported(), vec![ViolationKind::OutOfBounds]);

        assert_eq!(safepool_unregister_external(b.cast()), 1);
        assert_eq!(safepool_strlen(pool, b, 1), 0);
        assert_eq!(reported(), vec![ViolationKind::LoadStoreViolation]);
        assert_eq!(safepool_strlen(pool, b, 0), 7);
        assert!(reported().is_empty());
        safepool_pooldestroy(pool);
    }
}

#[test]
fn null_pool_handle_falls_back_to_libc() {
    let _guard = setup();
    let mut dst = [0u8; 8];
    let src = *b"plain\0";
    // SAFETY: stack buffers sized for the copies.
    unsafe {
        let d = dst.as_mut_ptr().cast::<c_char>();
        safepool_strcpy(ptr::null_mut(), ptr::null_mut(), d, src.as_ptr().cast(), 1);
        assert_eq!(text(d), b"plain");
        assert_eq!(safepool_strlen(ptr::null_mut(), d, 1), 5);
    }
    assert!(reported().is_empty());
}
