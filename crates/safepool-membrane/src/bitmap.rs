//! Two-bit-per-node state for a slab.
//!
//! Bit one says the node is allocated, bit two says the node begins an
//! allocation run. Multi-node runs are therefore one start bit followed by
//! allocated nodes without a start bit.

pub struct NodeBitmap {
    allocated: Vec<u64>,
    start: Vec<u64>,
    nodes: usize,
}

impl NodeBitmap {
    /// A bitmap for `nodes` nodes, all free.
    #[must_use]
    pub fn new(nodes: usize) -> Self {
        let words = nodes.div_ceil(64);
        Self {
            allocated: vec![0; words],
            start: vec![0; words],
            nodes,
        }
    }

    #[inline]
    #[must_use]
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    #[inline]
    #[must_use]
    pub fn is_allocated(&self, idx: usize) -> bool {
        idx < self.nodes && self.allocated[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline]
    pub fn mark_allocated(&mut self, idx: usize) {
        self.allocated[idx / 64] |= 1 << (idx % 64);
    }

    #[inline]
    pub fn mark_free(&mut self, idx: usize) {
        self.allocated[idx / 64] &= !(1 << (idx % 64));
    }

    #[inline]
    #[must_use]
    pub fn is_start(&self, idx: usize) -> bool {
        idx < self.nodes && self.start[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline]
    pub fn set_start(&mut self, idx: usize) {
        self.start[idx / 64] |= 1 << (idx % 64);
    }

    #[inline]
    pub fn clear_start(&mut self, idx: usize) {
        self.start[idx / 64] &= !(1 << (idx % 64));
    }

    /// Mark `idx..idx+count` as one allocation run.
    pub fn mark_run(&mut self, idx: usize, count: usize) {
        self.set_start(idx);
        for node in idx..idx + count {
            self.mark_allocated(node);
        }
    }

    /// True when every node in `idx..idx+count` is free.
    #[must_use]
    pub fn run_is_free(&self, idx: usize, count: usize) -> bool {
        idx + count <= self.nodes && (idx..idx + count).all(|node| !self.is_allocated(node))
    }

    /// One past the highest allocated node at or below `scan`, or 0 when
    /// none is allocated.
    #[must_use]
    pub fn last_allocated_through(&self, scan: usize) -> usize {
        if self.nodes == 0 {
            return 0;
        }
        let scan = scan.min(self.nodes - 1);
        let mut word = scan / 64;
        let bit = scan % 64;
        let mask = if bit == 63 { u64::MAX } else { (1u64 << (bit + 1)) - 1 };
        let mut bits = self.allocated[word] & mask;
        loop {
            if bits != 0 {
                let msb = 63 - bits.leading_zeros() as usize;
                return word * 64 + msb + 1;
            }
            if word == 0 {
                return 0;
            }
            word -= 1;
            bits = self.allocated[word];
        }
    }

    /// Number of allocated nodes.
    #[must_use]
    pub fn count_allocated(&self) -> usize {
        self.allocated.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Reset every node to free.
    pub fn clear(&mut self) {
        self.allocated.fill(0);
        self.start.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bitmap_is_free() {
        let bm = NodeBitmap::new(130);
        assert_eq!(bm.nodes(), 130);
        assert!((0..130).all(|i| !bm.is_allocated(i) && !bm.is_start(i)));
        assert!(!bm.is_allocated(500));
        assert_eq!(bm.count_allocated(), 0);
    }

    #[test]
    fn run_marks_start_once() {
        let mut bm = NodeBitmap::new(100);
        bm.mark_run(62, 4);
        assert!(bm.is_start(62));
        assert!(!bm.is_start(63));
        assert!((62..66).all(|i| bm.is_allocated(i)));
        assert!(!bm.run_is_free(60, 3));
        assert!(bm.run_is_free(66, 34));
        assert!(!bm.run_is_free(66, 35));
        assert_eq!(bm.count_allocated(), 4);
    }

    #[test]
    fn last_allocated_scans_back_across_words() {
        let mut bm = NodeBitmap::new(200);
        assert_eq!(bm.last_allocated_through(199), 0);
        bm.mark_allocated(3);
        bm.mark_allocated(70);
        assert_eq!(bm.last_allocated_through(199), 71);
        assert_eq!(bm.last_allocated_through(70), 71);
        assert_eq!(bm.last_allocated_through(69), 4);
        assert_eq!(bm.last_allocated_through(2), 0);
        bm.mark_allocated(127);
        assert_eq!(bm.last_allocated_through(127), 128);
    }

    #[test]
    fn clear_resets_everything() {
        let mut bm = NodeBitmap::new(10);
        bm.mark_run(0, 10);
        bm.clear();
        assert_eq!(bm.count_allocated(), 0);
        assert!(!bm.is_start(0));
    }
}
