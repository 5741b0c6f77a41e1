//! Metadata stack for pointers crossing call boundaries.
//!
//! Each frame is a two-word header `[previous size, current size]` followed
//! by four words `{base, bound, key, lock}` per pointer argument. The stack
//! pointer indexes the header of the innermost frame.

use crate::error::RuntimeError;
use crate::softbound::trie::PointerMetadata;

const FIELDS: usize = 4;
const HEADER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Base = 0,
    Bound = 1,
    Key = 2,
    Lock = 3,
}

pub struct ShadowStack {
    words: Vec<usize>,
    sp: usize,
}

impl ShadowStack {
    /// A stack of `words` words with an empty base frame.
    #[must_use]
    pub fn new(words: usize) -> Self {
        Self {
            words: vec![0; words.max(HEADER)],
            sp: 0,
        }
    }

    /// Frames pushed above the base frame.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut sp = self.sp;
        while sp != 0 {
            sp -= self.words[sp] + HEADER;
            depth += 1;
        }
        depth
    }

    /// Push a frame for `args` pointer arguments.
    pub fn allocate(&mut self, args: usize) -> Result<(), RuntimeError> {
        const OVERFLOW: RuntimeError = RuntimeError::ShadowStack("overflow");
        let prev = self.words[self.sp + 1];
        let sp = self.sp + prev + HEADER;
        let size = args.checked_mul(FIELDS).ok_or(OVERFLOW)?;
        let top = size.checked_add(sp + HEADER).ok_or(OVERFLOW)?;
        if top > self.words.len() {
            return Err(OVERFLOW);
        }
        self.sp = sp;
        self.words[sp] = prev;
        self.words[sp + 1] = size;
        Ok(())
    }

    /// Pop the innermost frame.
    pub fn deallocate(&mut self) -> Result<(), RuntimeError> {
        if self.sp == 0 {
            return Err(RuntimeError::ShadowStack("underflow"));
        }
        self.sp -= self.words[self.sp] + HEADER;
        Ok(())
    }

    fn index(&self, arg: usize, field: Field) -> Result<usize, RuntimeError> {
        let size = self.words[self.sp + 1];
        let offset = arg
            .checked_mul(FIELDS)
            .and_then(|slot| slot.checked_add(field as usize))
            .filter(|offset| *offset < size)
            .ok_or(RuntimeError::ShadowStack("argument out of frame"))?;
        Ok(self.sp + HEADER + offset)
    }

    pub fn store(&mut self, arg: usize, field: Field, value: usize) -> Result<(), RuntimeError> {
        let idx = self.index(arg, field)?;
        self.words[idx] = value;
        Ok(())
    }

    pub fn load(&self, arg: usize, field: Field) -> Result<usize, RuntimeError> {
        Ok(self.words[self.index(arg, field)?])
    }

    pub fn store_metadata(&mut self, arg: usize, meta: PointerMetadata) -> Result<(), RuntimeError> {
        self.store(arg, Field::Base, meta.base)?;
        self.store(arg, Field::Bound, meta.bound)?;
        self.store(arg, Field::Key, meta.key)?;
        self.store(arg, Field::Lock, meta.lock)
    }

    pub fn load_metadata(&self, arg: usize) -> Result<PointerMetadata, RuntimeError> {
        Ok(PointerMetadata {
            base: self.load(arg, Field::Base)?,
            bound: self.load(arg, Field::Bound)?,
            key: self.load(arg, Field::Key)?,
            lock: self.load(arg, Field::Lock)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_nest_and_unwind() {
        let mut stack = ShadowStack::new(64);
        stack.allocate(2).expect("caller frame");
        stack.store(1, Field::Bound, 0x40).expect("store");
        stack.allocate(1).expect("callee frame");
        stack.store(0, Field::Key, 7).expect("store");
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.load(0, Field::Key).expect("load"), 7);
        assert!(stack.load(1, Field::Base).is_err());

        stack.deallocate().expect("pop callee");
        assert_eq!(stack.load(1, Field::Bound).expect("caller intact"), 0x40);
        stack.deallocate().expect("pop caller");
        assert_eq!(stack.depth(), 0);
        assert!(stack.deallocate().is_err());
    }

    #[test]
    fn metadata_round_trips_through_a_frame() {
        let mut stack = ShadowStack::new(32);
        stack.allocate(1).expect("frame");
        let meta = PointerMetadata {
            base: 0x1000,
            bound: 0x1040,
            key: 5,
            lock: 0x8000,
        };
        stack.store_metadata(0, meta).expect("store");
        assert_eq!(stack.load_metadata(0).expect("load"), meta);
    }

    #[test]
    fn overflow_is_reported() {
        let mut stack = ShadowStack::new(12);
        stack.allocate(2).expect("fits");
        assert!(matches!(
            stack.allocate(1),
            Err(RuntimeError::ShadowStack("overflow"))
        ));
    }

    #[test]
    fn huge_argument_counts_are_rejected() {
        let mut stack = ShadowStack::new(16);
        assert!(matches!(
            stack.allocate(usize::MAX),
            Err(RuntimeError::ShadowStack("overflow"))
        ));
        assert!(matches!(
            stack.allocate(usize::MAX / FIELDS),
            Err(RuntimeError::ShadowStack("overflow"))
        ));
        assert_eq!(stack.depth(), 0);

        stack.allocate(1).expect("frame");
        assert!(matches!(
            stack.load(usize::MAX, Field::Lock),
            Err(RuntimeError::ShadowStack("argument out of frame"))
        ));
        assert!(stack.store(usize::MAX / FIELDS, Field::Lock, 1).is_err());
    }
}
