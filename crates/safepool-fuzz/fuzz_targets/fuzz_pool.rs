#![no_main]
use libfuzzer_sys::fuzz_target;
use safepool_membrane::{Runtime, RuntimeConfig, ViolationKind};

// Alloc/free/check sequences: live objects always resolve to themselves and
// freed ones never pass a dereference check.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let Ok(rt) = Runtime::quiet(RuntimeConfig::diagnostic().with_dangling(false)) else {
        return;
    };
    let mut pool = rt.pool_init(usize::from(data[0] % 64).max(1));
    let mut live: Vec<(usize, usize)> = Vec::new();

    for chunk in data[1..].chunks_exact(3) {
        let op = chunk[0] % 4;
        let arg = usize::from(u16::from_le_bytes([chunk[1], chunk[2]]));
        match op {
            0 => {
                let size = (arg % 8192).max(1);
                if let Some(p) = rt.pool_alloc(&mut pool, size) {
                    live.push((p, size));
                }
            }
            1 if !live.is_empty() => {
                let (p, _) = live.swap_remove(arg % live.len());
                rt.pool_free(&mut pool, p);
                if live.iter().all(|&(q, len)| p < q || p >= q + len) {
                    let err = rt.try_check_dereference(&pool, p);
                    assert!(matches!(err, Err(ref v) if v.kind == ViolationKind::DanglingPointer));
                }
            }
            2 if !live.is_empty() => {
                let (p, size) = live[arg % live.len()];
                let inner = p + arg % size;
                assert_eq!(pool.retrieve(inner), Some((p, size)));
                assert_eq!(rt.try_check_index(&pool, p, inner), Ok(inner));
            }
            3 if !live.is_empty() => {
                let (p, size) = live[arg % live.len()];
                // Anything past one-past-end is out of bounds.
                let far = p + size + 1 + arg;
                assert!(rt.try_check_index(&pool, p, far).is_err());
            }
            _ => {}
        }
        assert_eq!(pool.live_objects(), live.len());
    }

    for (p, _) in live {
        rt.pool_free(&mut pool, p);
    }
    assert_eq!(rt.pool_destroy(pool).live_nodes, 0);
});
