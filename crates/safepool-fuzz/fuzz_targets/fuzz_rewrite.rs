#![no_main]
use libfuzzer_sys::fuzz_target;
use safepool_membrane::{IndexingMode, Runtime, RuntimeConfig};

// Random walks in rewrite mode: every result maps back to the arithmetic
// value and re-entering the object yields a raw pointer again.
fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let config = RuntimeConfig::diagnostic()
        .with_dangling(false)
        .with_indexing(IndexingMode::Rewrite);
    let Ok(rt) = Runtime::quiet(config) else {
        return;
    };
    let mut pool = rt.pool_init(16);
    let size = usize::from(data[0]).max(1) * 8;
    let Some(base) = rt.pool_alloc(&mut pool, size) else {
        return;
    };

    let mut cursor = base;
    let mut value = base;
    for chunk in data[1..].chunks_exact(2) {
        let delta = isize::from(i16::from_le_bytes([chunk[0], chunk[1]]));
        let target = value.wrapping_add_signed(delta);
        let next = rt.check_index(&pool, cursor, cursor.wrapping_add_signed(delta));
        assert_eq!(rt.get_original_value(next), target);
        if base <= target && target < base + size {
            assert_eq!(next, target);
        } else {
            assert!(rt.is_sentinel(next));
        }
        cursor = next;
        value = target;
    }
    assert!(rt.drain_violations().is_empty());
    rt.pool_free(&mut pool, base);
});
