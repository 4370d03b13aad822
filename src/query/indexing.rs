//! Signed-index canonicalization shared by every positional operator.
//!
//! A logical index may be negative, meaning "from the end". Canonicalization
//! maps it onto an unsigned physical offset against a container size. Two
//! modes exist by convention at the call sites:
//!
//! - **element-indexed**: valid physical range `[0, size)`; callers pass
//!   `size` (NTH, CHANGE_AT, DELETE_AT).
//! - **space-indexed**: valid physical range `[0, size]`, referencing the
//!   gaps before/after elements; callers pass `size + 1` worth of headroom by
//!   checking against `size` inclusively (INSERT_AT, SPLICE_AT).
//!
//! The function itself is mode-agnostic: it only handles wraparound and the
//! below-zero case. Upper-bound checks belong to the callers.

use crate::reql::error::{QueryError, Result};

/// Map a signed logical index onto an unsigned physical offset.
///
/// Non-negative indexes pass through unchanged (the caller bound-checks
/// above). Negative indexes wrap from the end. A negative index that wraps
/// past the start either sets `out_of_bounds` and returns 0, or, when no
/// flag was supplied, fails with a non-existence error naming the original
/// signed index.
pub fn canonicalize(index: i64, size: u64, out_of_bounds: Option<&mut bool>) -> Result<u64> {
    if index >= 0 {
        return Ok(index as u64);
    }
    let from_end = index.unsigned_abs();
    if from_end > size {
        match out_of_bounds {
            Some(flag) => {
                *flag = true;
                Ok(0)
            }
            None => Err(QueryError::non_existence(format!(
                "Index out of bounds: {}",
                index
            ))),
        }
    } else {
        Ok(size - from_end)
    }
}

/// Resolve a pair of slice bounds into a clamped half-open physical range
/// `[start, end)`.
///
/// Each bound is canonicalized independently, then adjusted for openness: an
/// open left bound advances past the referenced index; a closed right bound
/// includes it. A left bound that wraps below zero starts at 0; a right
/// bound that wraps below zero selects nothing. A crossed range is empty,
/// not an error.
pub fn slice_bounds(
    left: i64,
    right: i64,
    left_open: bool,
    right_open: bool,
    size: u64,
) -> Result<(u64, u64)> {
    let mut left_oob = false;
    let mut start = canonicalize(left, size, Some(&mut left_oob))?;
    if left_open && !left_oob {
        start = start.saturating_add(1);
    }

    let mut right_oob = false;
    let mut end = canonicalize(right, size, Some(&mut right_oob))?;
    if right_oob {
        return Ok((0, 0));
    }
    if !right_open {
        end = end.saturating_add(1);
    }

    start = start.min(size);
    end = end.min(size);
    if start >= end {
        Ok((start, start))
    } else {
        Ok((start, end))
    }
}
