//! The built-in fusion passes.
//!
//! Each pass lives in its own file and implements
//! [`FusionPass`](crate::optimize::FusionPass). Shared attribute-decoding
//! helpers live here.

use crate::graph::OpDesc;
use crate::optimize::FusionError;

mod avg_pool;
mod conv2d_bp_filter_mul;
mod depthwise_channel_swap;
mod depthwise_df;
mod depthwise_dw_mul;
mod pooling;

pub use avg_pool::AvgPoolFusion;
pub use conv2d_bp_filter_mul::Conv2DbpFilterMulFusion;
pub use depthwise_channel_swap::DepthwiseChannelSwap;
pub use depthwise_df::DepthwiseDfFusion;
pub use depthwise_dw_mul::DepthwiseDwMulFusion;
pub use pooling::PoolingFusion;

/// Read the spatial `(height, width)` entries of a TensorFlow-style 4-element
/// attribute list (`ksize`, `strides`), whose axis order follows the node's
/// `data_format` attribute.
fn spatial_attr_pair(desc: &OpDesc, attr: &str) -> Result<[i64; 2], FusionError> {
    let list = desc
        .int_list_attr(attr)
        .ok_or_else(|| FusionError::ParamInvalid(format!("missing {} attribute", attr)))?;
    let (h_idx, w_idx) = match desc.str_attr("data_format") {
        Some("NCHW") => (2, 3),
        _ => (1, 2),
    };
    match (list.get(h_idx), list.get(w_idx)) {
        (Some(&h), Some(&w)) => Ok([h, w]),
        _ => Err(FusionError::ParamInvalid(format!(
            "{} attribute has {} entries, expected 4",
            attr,
            list.len()
        ))),
    }
}

/// Symmetric-ish padding for SAME-style pooling along one axis: total pad
/// `max((out-1)*stride + window - input, 0)`, split with the smaller half
/// before.
fn same_padding(input: i64, window: i64, stride: i64) -> [i64; 2] {
    let out = (input + stride - 1) / stride;
    let total = ((out - 1) * stride + window - input).max(0);
    let before = total / 2;
    [before, total - before]
}
