//! Pooling geometry: output extents and receptive-field overlap areas.
//!
//! These are pure functions over one spatial axis. Passes call them once per
//! axis (height then width) and combine the results.

/// Number of output cells along one axis of a pooling operation.
///
/// `ceil_mode` selects ceil instead of floor rounding of
/// `(input + pad_before + pad_after - window) / stride + 1`. When padding is
/// non-zero the last window must start strictly inside the padded input;
/// an extent whose final window starts at or beyond `input + pad_before` is
/// decremented by one.
pub fn pooling_output_extent(
    input_extent: i64,
    pad_before: i64,
    pad_after: i64,
    window: i64,
    stride: i64,
    ceil_mode: bool,
) -> i64 {
    let span = input_extent + pad_before + pad_after - window;
    let mut extent = if ceil_mode {
        (span + stride - 1) / stride + 1
    } else {
        span / stride + 1
    };
    if pad_before + pad_after > 0 && (extent - 1) * stride >= input_extent + pad_before {
        extent -= 1;
    }
    extent
}

/// Receptive-field overlap of one output cell with the input, as used by the
/// AvgPool fusion: the window is clamped to the unpadded input extent.
pub fn avg_pool_receptive_area(
    output_index: i64,
    stride: i64,
    pad_before: i64,
    window: i64,
    input_extent: i64,
) -> i64 {
    let start = output_index * stride - pad_before;
    let end = (start + window).min(input_extent);
    let start = start.max(0);
    (end - start).max(1)
}

/// Receptive-field overlap of one output cell with the input, as used by the
/// generic Pooling fusion: the window is clamped to `input + pad_before`.
///
/// This deliberately differs from [`avg_pool_receptive_area`] for non-zero
/// padding; the two callers have different historical numerics and must not
/// be unified.
pub fn pooling_receptive_area(
    output_index: i64,
    stride: i64,
    pad_before: i64,
    window: i64,
    input_extent: i64,
) -> i64 {
    let start = output_index * stride - pad_before;
    let end = (start + window).min(input_extent + pad_before);
    let start = start.max(0);
    (end - start).max(1)
}

/// True iff every output cell's receptive area is exactly
/// `window_h * window_w`, ie. no window hangs over a padded boundary.
///
/// When this holds a single scalar area factor suffices and the per-position
/// coefficient tensor can be skipped.
pub fn is_uniform_window(
    input_h: i64,
    input_w: i64,
    window: [i64; 2],
    stride: [i64; 2],
    pad: [i64; 4],
    ceil_mode: bool,
) -> bool {
    let [window_h, window_w] = window;
    let [stride_h, stride_w] = stride;
    let [pad_top, pad_bottom, pad_left, pad_right] = pad;

    let out_h = pooling_output_extent(input_h, pad_top, pad_bottom, window_h, stride_h, ceil_mode);
    let out_w = pooling_output_extent(input_w, pad_left, pad_right, window_w, stride_w, ceil_mode);

    let uniform_h = (0..out_h)
        .all(|oh| avg_pool_receptive_area(oh, stride_h, pad_top, window_h, input_h) == window_h);
    let uniform_w = (0..out_w)
        .all(|ow| avg_pool_receptive_area(ow, stride_w, pad_left, window_w, input_w) == window_w);
    uniform_h && uniform_w
}

#[cfg(test)]
mod tests {
    use super::{
        avg_pool_receptive_area, is_uniform_window, pooling_output_extent, pooling_receptive_area,
    };

    #[test]
    fn test_pooling_output_extent() {
        struct Case {
            input: i64,
            pad: [i64; 2],
            window: i64,
            stride: i64,
            ceil_mode: bool,
            expected: i64,
        }

        let cases = [
            // VALID-style, exact tiling.
            Case {
                input: 4,
                pad: [0, 0],
                window: 2,
                stride: 2,
                ceil_mode: false,
                expected: 2,
            },
            // Floor drops the partial trailing window.
            Case {
                input: 5,
                pad: [0, 0],
                window: 2,
                stride: 2,
                ceil_mode: false,
                expected: 2,
            },
            // Ceil keeps it.
            Case {
                input: 5,
                pad: [0, 0],
                window: 2,
                stride: 2,
                ceil_mode: true,
                expected: 3,
            },
            // SAME-style padding.
            Case {
                input: 5,
                pad: [0, 1],
                window: 2,
                stride: 2,
                ceil_mode: false,
                expected: 3,
            },
            // Ceil mode plus padding would start the last window at the
            // padded boundary (4 >= 3 + 1); the extent is clipped back.
            Case {
                input: 3,
                pad: [1, 1],
                window: 2,
                stride: 2,
                ceil_mode: true,
                expected: 2,
            },
            // Ceil mode plus padding, last window starts inside: no clip.
            Case {
                input: 7,
                pad: [1, 1],
                window: 3,
                stride: 3,
                ceil_mode: true,
                expected: 3,
            },
        ];

        for (
            i,
            Case {
                input,
                pad,
                window,
                stride,
                ceil_mode,
                expected,
            },
        ) in cases.into_iter().enumerate()
        {
            let extent = pooling_output_extent(input, pad[0], pad[1], window, stride, ceil_mode);
            assert_eq!(extent, expected, "case {}", i);
        }
    }

    #[test]
    fn test_receptive_area_no_padding_is_window() {
        // With zero padding every cell sees the full window (property of the
        // uniform fast path), and the two variants agree.
        for output_index in 0..4 {
            let a = avg_pool_receptive_area(output_index, 2, 0, 2, 8);
            let b = pooling_receptive_area(output_index, 2, 0, 2, 8);
            assert_eq!(a, 2);
            assert_eq!(b, 2);
        }
        assert!(is_uniform_window(8, 8, [2, 2], [2, 2], [0, 0, 0, 0], false));
    }

    #[test]
    fn test_receptive_area_variants_diverge_with_padding() {
        // input 5, window 3, stride 2, pad_before 1: the last output cell
        // (index 2) starts at 3 and would cover [3, 6). The AvgPool variant
        // clamps the end to the input extent (5), the Pooling variant to
        // input + pad (6).
        assert_eq!(avg_pool_receptive_area(2, 2, 1, 3, 5), 2);
        assert_eq!(pooling_receptive_area(2, 2, 1, 3, 5), 3);

        // First cell starts in the padding; both variants clamp the start.
        assert_eq!(avg_pool_receptive_area(0, 2, 1, 3, 5), 2);
        assert_eq!(pooling_receptive_area(0, 2, 1, 3, 5), 2);
    }

    #[test]
    fn test_receptive_area_minimum_one() {
        // A window that falls entirely outside the input still reports area
        // 1 so the reciprocal stays finite.
        assert_eq!(avg_pool_receptive_area(5, 2, 0, 2, 4), 1);
    }

    #[test]
    fn test_uniform_window_rejects_padding_overhang() {
        assert!(!is_uniform_window(5, 5, [2, 2], [2, 2], [0, 1, 0, 1], false));
        // Padding that is fully consumed by an exact tiling is still
        // non-uniform on the boundary cells.
        assert!(!is_uniform_window(6, 6, [2, 2], [2, 2], [1, 1, 1, 1], false));
    }
}
