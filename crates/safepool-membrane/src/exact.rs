//! Exact checks: bounds known statically at the call site.
//!
//! No registry lookup is involved; the caller passes the object bounds it
//! already knows. All of these return the violation they detect and leave
//! the enforcement decision to the runtime.

use crate::violation::{ObjectBounds, Violation, ViolationKind};

/// Index `index` must satisfy `0 <= index < bound`.
pub fn exact_check(index: i64, bound: i64) -> Result<(), Violation> {
    if index < 0 || index >= bound {
        return Err(Violation::new(ViolationKind::OutOfBounds, index as usize)
            .with_detail(format!("index {index} outside [0, {bound})")));
    }
    Ok(())
}

/// `result` must lie in `[base, base+size)`.
pub fn exact_check2(base: usize, result: usize, size: usize) -> Result<(), Violation> {
    let end = base.wrapping_add(size);
    if result < base || result >= end {
        return Err(out_of_object(base, end, result));
    }
    Ok(())
}

/// Upper bound only: `result < base+size`.
pub fn exact_check2a(base: usize, result: usize, size: usize) -> Result<(), Violation> {
    let end = base.wrapping_add(size);
    if result >= end {
        return Err(out_of_object(base, end, result));
    }
    Ok(())
}

/// Inclusive end: `base <= result <= end`.
pub fn exact_check3(base: usize, result: usize, end: usize) -> Result<(), Violation> {
    if result < base || result > end {
        return Err(out_of_object(base, end, result));
    }
    Ok(())
}

fn out_of_object(start: usize, end: usize, result: usize) -> Violation {
    Violation::new(ViolationKind::OutOfBounds, result)
        .with_index(start, result)
        .with_object(ObjectBounds { start, end })
}

/// An indirect call target must be one of the statically known candidates.
pub fn function_pointer_check(target: usize, candidates: &[usize]) -> Result<(), Violation> {
    if candidates.contains(&target) {
        return Ok(());
    }
    Err(Violation::new(ViolationKind::FunctionPointerViolation, target)
        .with_detail(format!("target not among {} valid callees", candidates.len())))
}
