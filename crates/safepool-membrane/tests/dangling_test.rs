#![cfg(all(target_os = "linux", feature = "dangling-detector"))]

use std::ptr;

use safepool_membrane::{EnforcementMode, Runtime, RuntimeConfig, ViolationKind};

fn detecting_runtime() -> Runtime {
    let config = RuntimeConfig::diagnostic().with_dangling(true);
    assert_eq!(config.mode, EnforcementMode::Diagnostic);
    Runtime::quiet(config).expect("runtime")
}

#[test]
fn allocation_scenario_end_to_end() {
    let rt = detecting_runtime();
    let mut pool = rt.pool_init(8);
    let p = rt.pool_alloc(&mut pool, 40).expect("alloc");

    assert_eq!(rt.check_index(&pool, p, p + 36), p + 36);

    let past = rt.check_index(&pool, p, p + 40);
    assert_ne!(past, p + 40);
    assert!(rt.is_sentinel(past));
    assert!(pool.retrieve(past).is_none());
    assert!(rt.violations().is_empty());

    rt.pool_free(&mut pool, p);
    rt.check_dereference(&pool, p);
    let reported = rt.drain_violations();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].kind, ViolationKind::DanglingPointer);
    let prov = reported[0].provenance.expect("provenance");
    assert_eq!(prov.alloc_epoch, 1);
    assert_eq!(prov.free_epoch, Some(1));
}

#[test]
fn access_through_a_freed_pointer_traps() {
    let rt = detecting_runtime();
    let mut pool = rt.pool_init(16);
    let p = rt.pool_alloc(&mut pool, 16).expect("alloc");
    let neighbour = rt.pool_alloc(&mut pool, 16).expect("alloc");
    // SAFETY: both are live 16-byte objects.
    unsafe {
        ptr::write_volatile(p as *mut u64, 0xfeed);
        ptr::write_volatile(neighbour as *mut u64, 0xbeef);
    }
    rt.pool_free(&mut pool, p);

    // SAFETY: the alias behind `p` is protected; the fault handler restores
    // access in diagnostic mode and the read completes.
    let _ = unsafe { ptr::read_volatile(p as *const u64) };
    assert_eq!(rt.sync_traps(), 1);

    let reported = rt.drain_violations();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].kind, ViolationKind::DanglingPointer);
    assert_eq!(reported[0].fault_address, p);
    let object = reported[0].object.expect("object bounds");
    assert_eq!((object.start, object.end), (p, p + 16));
    assert_eq!(reported[0].provenance.and_then(|prov| prov.free_epoch), Some(1));
    assert_eq!(rt.metrics().traps, 1);

    // The neighbour has its own alias and stays accessible.
    // SAFETY: `neighbour` is live.
    assert_eq!(unsafe { ptr::read_volatile(neighbour as *const u64) }, 0xbeef);
    assert_eq!(rt.sync_traps(), 0);
}

#[test]
fn reused_storage_gets_a_fresh_alias() {
    let rt = detecting_runtime();
    let mut pool = rt.pool_init(32);
    let p = rt.pool_alloc(&mut pool, 32).expect("alloc");
    rt.pool_free(&mut pool, p);
    let q = rt.pool_alloc(&mut pool, 32).expect("alloc");
    assert_ne!(p, q, "a retired alias is never handed out again while the pool lives");
    assert!(rt.try_check_dereference(&pool, q).is_ok());
    let err = rt.try_check_dereference(&pool, p).expect_err("old alias");
    assert_eq!(err.kind, ViolationKind::DanglingPointer);
    let stats = rt.pool_destroy(pool);
    assert_eq!(stats.live_nodes, 1);
}

#[test]
fn destroyed_pool_releases_its_fault_records() {
    let rt = detecting_runtime();
    let mut pool = rt.pool_init(16);
    let p = rt.pool_alloc(&mut pool, 16).expect("alloc");
    rt.pool_free(&mut pool, p);
    assert!(safepool_membrane::dangling::fault_record(p).is_some());
    let _ = rt.pool_destroy(pool);
    assert!(safepool_membrane::dangling::fault_record(p).is_none());
}
