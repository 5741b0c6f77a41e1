//! Contract tests for the exported entry points.

use std::ffi::{CStr, c_char, c_void};
use std::ptr;
use std::sync::{Mutex, MutexGuard, Once};

use safepool_abi::check_abi::{
    safepool_boundscheck, safepool_boundscheck_debug, safepool_boundscheckui,
    safepool_exactcheck, safepool_exactcheck2, safepool_exactcheck3, safepool_funccheck,
    safepool_get_actual_val, safepool_is_rewritten, safepool_poolcheck, safepool_poolcheck_debug,
    safepool_poolcheckalign, safepool_poolcheckui, safepool_violation_count,
};
use safepool_abi::pool_abi::{
    safepool_alloca, safepool_delstack, safepool_newstack, safepool_poolalloc,
    safepool_poolalloc_debug, safepool_poolcalloc, safepool_pooldestroy, safepool_poolfree,
    safepool_poolinit, safepool_poolrealloc, safepool_poolregister, safepool_poolstrdup,
    safepool_register_external, safepool_unregister_external,
};
use safepool_abi::runtime_state::global_runtime;
use safepool_membrane::ViolationKind;

static INIT: Once = Once::new();
static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests on the shared runtime and make sure it runs in
/// diagnostic mode so violations are reported instead of aborting.
fn setup() -> MutexGuard<'static, ()> {
    INIT.call_once(|| {
        // SAFETY: runs once, before any test reads the environment.
        unsafe {
            std::env::set_var("SAFEPOOL_MODE", "diagnostic");
            std::env::set_var("SAFEPOOL_INDEXING", "one-past-end");
            std::env::set_var("SAFEPOOL_DANGLING", "0");
            std::env::set_var("SAFEPOOL_TRACK_EXTERNAL", "1");
        }
        let runtime = global_runtime().expect("runtime");
        assert!(runtime.config().mode.checks_enabled());
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

fn addr(p: *mut c_void) -> usize {
    p as usize
}

#[test]
fn alloc_check_free_round_trip() {
    let _guard = setup();
    // SAFETY: handles and pointers below come from the entry points themselves.
    unsafe {
        let pool = safepool_poolinit(16);
        assert!(!pool.is_null());
        let p = safepool_poolalloc(pool, 40);
        assert!(!p.is_null());

        safepool_poolcheck(pool, p.cast::<u8>().add(39).cast());
        let inside = safepool_boundscheck(pool, p, p.cast::<u8>().add(36).cast());
        assert_eq!(addr(inside), addr(p) + 36);

        let past = safepool_boundscheck(pool, p, p.cast::<u8>().add(40).cast());
        assert_ne!(addr(past), addr(p) + 40);
        assert_eq!(safepool_is_rewritten(past), 1);
        assert_eq!(addr(safepool_get_actual_val(past)), addr(p) + 40);
        assert!(reported().is_empty());

        safepool_poolfree(pool, p);
        safepool_poolcheck(pool, p);
        assert_eq!(reported(), vec![ViolationKind::DanglingPointer]);

        safepool_poolfree(pool, p);
        assert_eq!(reported(), vec![ViolationKind::DoubleFree]);
        safepool_pooldestroy(pool);
    }
}

#[test]
fn debug_variants_carry_the_call_site() {
    let _guard = setup();
    // SAFETY: as above.
    unsafe {
        let pool = safepool_poolinit(8);
        let file = c"list.c".as_ptr();
        let p = safepool_poolalloc_debug(pool, 8, file, 12);
        let _ = safepool_boundscheck_debug(pool, p, p.cast::<u8>().add(64).cast(), file, 30);
        safepool_poolcheck_debug(pool, p.cast::<u8>().add(8).cast(), file, 31);
        let found = global_runtime().expect("runtime").drain_violations();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].kind, ViolationKind::OutOfBounds);
        assert_eq!(found[0].source_file.as_deref(), Some("list.c"));
        assert_eq!(found[0].source_line, Some(30));
        assert_eq!(found[1].source_line, Some(31));
        safepool_pooldestroy(pool);
    }
}

#[test]
fn calloc_realloc_strdup_behave_like_libc() {
    let _guard = setup();
    // SAFETY: as above.
    unsafe {
        let pool = safepool_poolinit(32);
        let z = safepool_poolcalloc(pool, 4, 8).cast::<u8>();
        assert!(std::slice::from_raw_parts(z, 32).iter().all(|b| *b == 0));
        assert!(safepool_poolcalloc(pool, usize::MAX, 4).is_null());

        z.write(0x5a);
        let grown = safepool_poolrealloc(pool, z.cast(), 256).cast::<u8>();
        assert_eq!(grown.read(), 0x5a);
        assert!(safepool_poolrealloc(pool, grown.cast(), 0).is_null());

        let copy = safepool_poolstrdup(pool, c"pool".as_ptr()).cast::<c_char>();
        assert_eq!(CStr::from_ptr(copy).to_bytes(), b"pool");
        assert!(safepool_poolstrdup(pool, ptr::null()).is_null());
        assert!(reported().is_empty());
        safepool_pooldestroy(pool);
    }
}

#[test]
fn registered_and_external_objects_are_checked() {
    let _guard = setup();
    let mut local = [0u32; 8];
    let mut buffer = [0u8; 16];
    // SAFETY: as above; the arrays outlive their registrations.
    unsafe {
        let pool = safepool_poolinit(4);
        let l = local.as_mut_ptr().cast::<c_void>();
        safepool_poolregister(pool, l, 32);
        let r = safepool_boundscheck(pool, l, l.cast::<u8>().add(28).cast());
        assert_eq!(addr(r), addr(l) + 28);

        let b = buffer.as_mut_ptr().cast::<c_void>();
        safepool_register_external(b, 16);
        let r = safepool_boundscheckui(pool, b, b.cast::<u8>().add(8).cast());
        assert_eq!(addr(r), addr(b) + 8);
        safepool_poolcheckui(pool, b);
        assert!(reported().is_empty());
        assert_eq!(safepool_unregister_external(b), 1);
        safepool_pooldestroy(pool);
    }
}

#[test]
fn external_objects_bound_both_check_variants() {
    let _guard = setup();
    let mut buffer = vec![0u8; 16];
    // SAFETY: as above; the buffer outlives its registration.
    unsafe {
        let pool = safepool_poolinit(8);
        let b = buffer.as_mut_ptr().cast::<c_void>();
        safepool_register_external(b, 16);

        let r = safepool_boundscheck(pool, b, b.cast::<u8>().add(4).cast());
        assert_eq!(addr(r), addr(b) + 4);
        safepool_poolcheck(pool, b.cast::<u8>().add(12).cast());
        assert!(reported().is_empty());

        safepool_boundscheckui(pool, b, b.cast::<u8>().add(64).cast());
        assert_eq!(reported(), vec![ViolationKind::OutOfBounds]);
        safepool_boundscheck(pool, b, b.cast::<u8>().add(64).cast());
        assert_eq!(reported(), vec![ViolationKind::OutOfBounds]);

        assert_eq!(safepool_unregister_external(b), 1);
        safepool_poolcheck(pool, b);
        assert_eq!(reported(), vec![ViolationKind::LoadStoreViolation]);
        safepool_pooldestroy(pool);
    }
}

#[test]
fn stack_frames_release_their_objects() {
    let _guard = setup();
    // SAFETY: as above.
    unsafe {
        let pool = safepool_poolinit(8);
        assert_eq!(safepool_newstack(pool), 0);
        let a = safepool_alloca(pool, 24);
        let b = safepool_alloca(pool, 8);
        assert!(!a.is_null() && !b.is_null());
        safepool_poolcheck(pool, a);
        assert_eq!(safepool_delstack(pool), 2);
        safepool_poolcheck(pool, a);
        assert_eq!(reported(), vec![ViolationKind::DanglingPointer]);
        safepool_pooldestroy(pool);
    }
}

#[test]
fn exact_alignment_and_indirect_call_checks() {
    let _guard = setup();
    let before = safepool_violation_count();
    safepool_exactcheck(3, 4);
    safepool_exactcheck(4, 4);
    let base = 0x1000 as *mut c_void;
    let r = safepool_exactcheck2(base, 0x1010 as *mut c_void, 0x20);
    assert_eq!(addr(r), 0x1010);
    let r = safepool_exactcheck3(base, 0x1020 as *mut c_void, 0x1020 as *mut c_void);
    assert_eq!(addr(r), 0x1020);

    let candidates = [0x400 as *const c_void, 0x480 as *const c_void];
    // SAFETY: candidates is a live array of two pointers.
    unsafe {
        safepool_funccheck(0x480 as *const c_void, candidates.as_ptr(), 2);
        safepool_funccheck(0x404 as *const c_void, candidates.as_ptr(), 2);

        let pool = safepool_poolinit(32);
        let p = safepool_poolalloc(pool, 32);
        safepool_poolcheckalign(pool, p.cast::<u8>().add(8).cast(), 8);
        safepool_poolcheckalign(pool, p.cast::<u8>().add(8).cast(), 4);
        safepool_pooldestroy(pool);
    }
    assert_eq!(
        reported(),
        vec![
            ViolationKind::OutOfBounds,
            ViolationKind::FunctionPointerViolation,
            ViolationKind::AlignmentViolation,
        ]
    );
    assert_eq!(safepool_violation_count() - before, 3);
}

#[test]
fn null_pool_handles_are_inert() {
    let _guard = setup();
    // SAFETY: null handles are accepted by every pool entry point.
    unsafe {
        let pool = ptr::null_mut();
        assert!(safepool_poolalloc(pool, 8).is_null());
        safepool_poolfree(pool, 0x1234 as *mut c_void);
        let r = safepool_boundscheck(pool, 0x1000 as *mut c_void, 0x9000 as *mut c_void);
        assert_eq!(addr(r), 0x9000);
        safepool_pooldestroy(pool);
    }
    assert!(reported().is_empty());
}
