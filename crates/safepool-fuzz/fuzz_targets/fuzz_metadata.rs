#![no_main]
use std::collections::HashMap;

use libfuzzer_sys::fuzz_target;
use safepool_membrane::softbound::MetadataTrie;
use safepool_membrane::PointerMetadata;

// Trie against a map model: loads return the last store, untouched slots
// load as zero, copies move whole tuples.
fuzz_target!(|data: &[u8]| {
    let trie = MetadataTrie::new();
    let mut model: HashMap<usize, PointerMetadata> = HashMap::new();

    for chunk in data.chunks_exact(6) {
        let index = u32::from_le_bytes([chunk[1], chunk[2], chunk[3], 0]) as usize;
        let slot = 0x7f00_0000_0000 + (index << 3);
        let word = usize::from(u16::from_le_bytes([chunk[4], chunk[5]]));
        match chunk[0] % 3 {
            0 => {
                let meta = PointerMetadata {
                    base: word,
                    bound: word + 64,
                    key: word + 2,
                    lock: word << 4,
                };
                if trie.store(slot, meta).is_ok() {
                    model.insert(slot, meta);
                }
            }
            1 => {
                let expected = model.get(&slot).copied().unwrap_or_default();
                assert_eq!(trie.load(slot), expected);
            }
            _ => {
                let dest = slot + ((word % 64) << 3);
                let words = 1 + word % 8;
                if trie.copy_metadata(dest, slot, words * 8).is_ok() {
                    let copied: Vec<_> = (0..words)
                        .map(|i| model.get(&(slot + i * 8)).copied().unwrap_or_default())
                        .collect();
                    for (i, meta) in copied.into_iter().enumerate() {
                        model.insert(dest + i * 8, meta);
                    }
                }
            }
        }
    }

    for (slot, meta) in &model {
        assert_eq!(trie.load(*slot), *meta);
    }
});
