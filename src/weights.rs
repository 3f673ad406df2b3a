//! Synthesis of the constant tensors attached by the fusion passes: fp16
//! area-correction factors, per-position coefficient matrices and int8
//! bias vectors derived from kernel sums.

use std::error::Error;
use std::fmt;

use crate::arith::{kernel_element_count, Overflow};
use crate::geometry::{avg_pool_receptive_area, pooling_receptive_area};
use crate::graph::ConstData;
use crate::half::f32_to_f16;

/// Which receptive-area clamp a coefficient matrix uses. The two variants
/// diverge at padded borders and both behaviors are load-bearing; see
/// [`crate::geometry`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AreaVariant {
    AvgPool,
    Pooling,
}

impl AreaVariant {
    fn area(
        self,
        out_index: i64,
        stride: i64,
        pad_before: i64,
        window: i64,
        input_extent: i64,
    ) -> i64 {
        match self {
            AreaVariant::AvgPool => {
                avg_pool_receptive_area(out_index, stride, pad_before, window, input_extent)
            }
            AreaVariant::Pooling => {
                pooling_receptive_area(out_index, stride, pad_before, window, input_extent)
            }
        }
    }
}

/// Errors from weight synthesis.
#[derive(Clone, Debug, PartialEq)]
pub enum WeightError {
    Overflow,
    /// A flat filter index fell outside the declared element count.
    IndexOutOfRange { index: i64, count: i64 },
}

impl fmt::Display for WeightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightError::Overflow => write!(f, "element count exceeds i64 range"),
            WeightError::IndexOutOfRange { index, count } => {
                write!(f, "filter index {} out of range for {} elements", index, count)
            }
        }
    }
}

impl Error for WeightError {}

impl From<Overflow> for WeightError {
    fn from(_: Overflow) -> WeightError {
        WeightError::Overflow
    }
}

/// Constant filled with a single fp16 factor, eg. `1 / (window_h * window_w)`
/// for an average pool with no padding.
pub fn uniform_area_factor(count: usize, factor: f32) -> ConstData {
    ConstData::F16(vec![f32_to_f16(factor); count])
}

/// Geometry of a pooling window, as read off the matched node's attributes.
#[derive(Copy, Clone, Debug)]
pub struct WindowGeometry {
    pub window: [i64; 2],
    pub stride: [i64; 2],
    /// Pads in `[top, bottom, left, right]` order.
    pub pad: [i64; 4],
    pub input_hw: [i64; 2],
}

/// Build the per-position fp16 coefficient matrix for a padded average pool,
/// tiled as NC1HWC0 over `shape = [n, c1, h, w, C0]` with C0 fastest.
///
/// The coefficient for spatial position `(h, w)` is `1 / area(h, w)` where
/// the area is the window's receptive area clipped per `variant`. All `C0`
/// lanes of a position share one value, as do all `n * c1` tiles. For int8
/// pools the kernel itself is pre-scaled by `window_h * window_w` elsewhere,
/// so the coefficient becomes `(window_h * window_w) / area(h, w)` to cancel
/// that factor on interior positions.
pub fn position_coefficient_matrix(
    shape: [i64; 5],
    geom: &WindowGeometry,
    is_int8: bool,
    variant: AreaVariant,
) -> Result<ConstData, Overflow> {
    let len = kernel_element_count(1, &shape)?;
    let [n, c1, out_h, out_w, c0] = shape;
    let [window_h, window_w] = geom.window;
    let [stride_h, stride_w] = geom.stride;
    let [pad_top, _, pad_left, _] = geom.pad;
    let [input_h, input_w] = geom.input_hw;

    let numerator = if is_int8 {
        (window_h * window_w) as f32
    } else {
        1.0
    };

    let mut data = Vec::with_capacity(len as usize);
    for _ in 0..n * c1 {
        for h in 0..out_h {
            let area_h = variant.area(h, stride_h, pad_top, window_h, input_h);
            for w in 0..out_w {
                let area_w = variant.area(w, stride_w, pad_left, window_w, input_w);
                let bits = f32_to_f16(numerator / (area_h * area_w) as f32);
                for _ in 0..c0 {
                    data.push(bits);
                }
            }
        }
    }
    Ok(ConstData::F16(data))
}

/// Per-output-channel sums of an int8 filter laid out `[Co, Ci, Kh, Kw]`
/// (flat index `co * Ci * Kh * Kw + ci * Kh * Kw + kh * Kw + kw`).
///
/// `dims` is `[Ci, Co, Kh, Kw]` as carried by the filter's origin descriptor.
/// Every flat index is checked against the filter's element count before use.
pub fn int8_kernel_sums(filter: &[i8], dims: [i64; 4]) -> Result<Vec<i32>, WeightError> {
    let [ci, co, kh, kw] = dims;
    let count = kernel_element_count(1, &dims)?;
    if count > filter.len() as i64 {
        return Err(WeightError::IndexOutOfRange {
            index: count - 1,
            count: filter.len() as i64,
        });
    }
    let mut sums = Vec::with_capacity(co.max(0) as usize);
    for co_i in 0..co {
        let mut sum: i32 = 0;
        for ci_i in 0..ci {
            for kh_i in 0..kh {
                for kw_i in 0..kw {
                    let index = co_i * (ci * kh * kw) + ci_i * (kh * kw) + kh_i * kw + kw_i;
                    if index >= count {
                        return Err(WeightError::IndexOutOfRange { index, count });
                    }
                    sum += filter[index as usize] as i32;
                }
            }
        }
        sums.push(sum);
    }
    Ok(sums)
}

/// Bias correction for an asymmetric int8 input offset: `-offset * sum` per
/// output channel, or all zeros on ISA revisions whose matmul applies the
/// offset in hardware.
pub fn offset_bias(kernel_sums: &[i32], offset: i8, isa_version: i64) -> Vec<i32> {
    if isa_version == 1 {
        return vec![0; kernel_sums.len()];
    }
    kernel_sums
        .iter()
        .map(|&sum| -(offset as i32) * sum)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        int8_kernel_sums, offset_bias, position_coefficient_matrix, uniform_area_factor,
        AreaVariant, WeightError, WindowGeometry,
    };
    use crate::graph::ConstData;
    use crate::half::f16_to_f32;

    fn f16_values(data: &ConstData) -> Vec<f32> {
        match data {
            ConstData::F16(bits) => bits.iter().map(|&b| f16_to_f32(b)).collect(),
            _ => panic!("expected fp16 data"),
        }
    }

    #[test]
    fn test_uniform_area_factor() {
        let data = uniform_area_factor(4, 0.25);
        assert_eq!(f16_values(&data), [0.25; 4]);
    }

    #[test]
    fn test_coefficient_matrix_interior_and_border() {
        // 4x4 input, 3x3 window, stride 1, pad 1 all around => 4x4 output.
        let geom = WindowGeometry {
            window: [3, 3],
            stride: [1, 1],
            pad: [1, 1, 1, 1],
            input_hw: [4, 4],
        };
        let data =
            position_coefficient_matrix([1, 1, 4, 4, 16], &geom, false, AreaVariant::AvgPool)
                .unwrap();
        let values = f16_values(&data);
        assert_eq!(values.len(), 4 * 4 * 16);

        let at = |h: usize, w: usize| values[(h * 4 + w) * 16];
        // A corner window covers 2x2 real elements, an edge 2x3, the
        // interior the full 3x3.
        let f16 = |v: f32| f16_to_f32(crate::half::f32_to_f16(v));
        assert_eq!(at(0, 0), 1.0 / 4.0);
        assert_eq!(at(0, 1), f16(1.0 / 6.0));
        assert_eq!(at(1, 1), f16(1.0 / 9.0));
        // All C0 lanes of one position share the value.
        assert_eq!(values[0], values[15]);
    }

    #[test]
    fn test_coefficient_matrix_variants_diverge() {
        // Odd extent with padding: the last output row's area differs
        // between the two clamps.
        let geom = WindowGeometry {
            window: [3, 3],
            stride: [2, 2],
            pad: [1, 1, 1, 1],
            input_hw: [5, 5],
        };
        let avg = f16_values(
            &position_coefficient_matrix([1, 1, 3, 3, 16], &geom, false, AreaVariant::AvgPool)
                .unwrap(),
        );
        let pool = f16_values(
            &position_coefficient_matrix([1, 1, 3, 3, 16], &geom, false, AreaVariant::Pooling)
                .unwrap(),
        );
        // Position (2, 2): plain clamp gives a 2x2 area, the pad-inclusive
        // clamp a 3x3 one.
        let last = (2 * 3 + 2) * 16;
        assert_eq!(avg[last], 1.0 / 4.0);
        assert_eq!(pool[last], f16_to_f32(crate::half::f32_to_f16(1.0 / 9.0)));
        assert_ne!(avg[last], pool[last]);
        // Interior positions agree.
        assert_eq!(avg[(3 + 1) * 16], pool[(3 + 1) * 16]);
    }

    #[test]
    fn test_coefficient_matrix_int8_prescale() {
        let geom = WindowGeometry {
            window: [2, 2],
            stride: [1, 1],
            pad: [1, 0, 1, 0],
            input_hw: [3, 3],
        };
        let data =
            position_coefficient_matrix([1, 1, 3, 3, 16], &geom, true, AreaVariant::AvgPool)
                .unwrap();
        let values = f16_values(&data);
        // Interior position: area equals the full window, coefficient is
        // exactly 1 so the pre-scaled kernel is left untouched.
        assert_eq!(values[(3 + 1) * 16], 1.0);
        // Corner position covers 1x1, coefficient 4 / 1.
        assert_eq!(values[0], 4.0);
    }

    #[test]
    fn test_int8_kernel_sums() {
        // Ci=2, Co=2, Kh=1, Kw=2; layout is Co-major.
        let filter: Vec<i8> = vec![1, 2, 3, 4, -1, -2, -3, 10];
        let sums = int8_kernel_sums(&filter, [2, 2, 1, 2]).unwrap();
        assert_eq!(sums, [10, 4]);
    }

    #[test]
    fn test_int8_kernel_sums_bounds() {
        let filter: Vec<i8> = vec![0; 4];
        let err = int8_kernel_sums(&filter, [2, 2, 1, 2]).unwrap_err();
        assert!(matches!(err, WeightError::IndexOutOfRange { .. }));
    }

    #[test]
    fn test_offset_bias() {
        assert_eq!(offset_bias(&[10, -4], 3, 0), [-30, 12]);
        // Revision 1 applies the offset in hardware.
        assert_eq!(offset_bias(&[10, -4], 3, 1), [0, 0]);
    }
}
