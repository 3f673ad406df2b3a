//! Overflow-checked 64-bit arithmetic for kernel element counting.
//!
//! Fusion passes compute total element counts of filter tensors before
//! synthesizing payload buffers. A silent wrap here would produce an
//! undersized buffer, so every multiply is range-checked up front and the
//! caller treats `Overflow` as "fusion not applicable" rather than an
//! engine error.

use std::error::Error;
use std::fmt::{Display, Formatter};

/// The mathematical product fell outside the i64 range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Overflow;

impl Display for Overflow {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "64-bit multiply overflow")
    }
}

impl Error for Overflow {}

/// Multiply a running accumulator by the next factor, failing with
/// [`Overflow`] if the product would leave the i64 range.
///
/// The range check is performed by sign-aware pre-division before the
/// multiply, covering all four sign combinations of the operands.
pub fn checked_mul_add(accumulator: i64, factor: i64) -> Result<i64, Overflow> {
    if accumulator > 0 {
        if factor > 0 {
            if accumulator > i64::MAX / factor {
                return Err(Overflow);
            }
        } else if factor < i64::MIN / accumulator {
            return Err(Overflow);
        }
    } else if factor > 0 {
        if accumulator < i64::MIN / factor {
            return Err(Overflow);
        }
    } else if accumulator != 0 && factor < i64::MAX / accumulator {
        return Err(Overflow);
    }
    Ok(accumulator * factor)
}

/// Total element count of a filter tensor, as a left fold of
/// [`checked_mul_add`] over `dims` starting from `seed`.
///
/// The seed lets a caller fold in a leading dimension it has already counted.
pub fn kernel_element_count(seed: i64, dims: &[i64]) -> Result<i64, Overflow> {
    dims.iter()
        .try_fold(seed, |acc, &dim| checked_mul_add(acc, dim))
}
