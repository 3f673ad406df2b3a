//! Masks the cross-group blocks of a grouped `Conv2DBackpropFilterD`.
//!
//! The hardware computes the filter gradient densely, as if the convolution
//! had one group; taps connecting an output channel to an input channel of a
//! different group must then be zeroed. The rewrite splices a `Mul` behind
//! the gradient output whose second operand is a block-diagonal 0/1 mask.

use crate::descriptor::{DataType, Format, TensorDesc};
use crate::editor::GraphEditor;
use crate::graph::{ConstData, Graph, NodeId};
use crate::half::f32_to_f16;
use crate::optimize::{FusionError, FusionPass, FusionPattern, FusionStatus, Mapping};

pub struct Conv2DbpFilterMulFusion;

impl Conv2DbpFilterMulFusion {
    pub fn new() -> Conv2DbpFilterMulFusion {
        Conv2DbpFilterMulFusion
    }
}

impl Default for Conv2DbpFilterMulFusion {
    fn default() -> Self {
        Conv2DbpFilterMulFusion::new()
    }
}

/// Block-diagonal fp16 mask over an NCHW `[co, ci, kh, kw]` filter-gradient
/// shape: 1 where `co` and `ci` fall in the same group, 0 elsewhere.
fn group_mask(dims: [i64; 4], groups: i64) -> ConstData {
    let [co, ci, kh, kw] = dims;
    let co_per_group = co / groups;
    let ci_per_group = ci / groups;
    let one = f32_to_f16(1.0);
    let zero = f32_to_f16(0.0);

    let mut mask = Vec::with_capacity((co * ci * kh * kw) as usize);
    for co_i in 0..co {
        for ci_i in 0..ci {
            let bit = if co_i / co_per_group == ci_i / ci_per_group {
                one
            } else {
                zero
            };
            for _ in 0..kh * kw {
                mask.push(bit);
            }
        }
    }
    ConstData::F16(mask)
}

impl FusionPass for Conv2DbpFilterMulFusion {
    fn name(&self) -> &str {
        "Conv2DbpFilterMulFusion"
    }

    fn patterns(&self) -> Vec<FusionPattern> {
        vec![FusionPattern::new("conv2d_bp_filter").with_op("grad", &["Conv2DBackpropFilterD"])]
    }

    fn fuse(
        &mut self,
        graph: &mut Graph,
        mapping: &Mapping,
        new_nodes: &mut Vec<NodeId>,
    ) -> Result<FusionStatus, FusionError> {
        let grad = mapping
            .node("grad")
            .ok_or_else(|| FusionError::ParamInvalid("grad anchor missing".to_string()))?;
        let mut editor = GraphEditor::new(graph);
        if editor.is_transformed(grad) {
            return Ok(FusionStatus::NotChanged);
        }

        let (groups, out_desc) = {
            let node = editor
                .graph()
                .get(grad)
                .ok_or_else(|| FusionError::ParamInvalid("node removed".to_string()))?;
            let groups = node.desc().int_attr("groups").unwrap_or(1);
            let out_desc = node.desc().output_descs.first().cloned().ok_or_else(|| {
                FusionError::ParamInvalid("missing output descriptor".to_string())
            })?;
            (groups, out_desc)
        };

        // A single group has no cross-group taps to zero.
        if groups <= 1 {
            return Ok(FusionStatus::NotChanged);
        }
        if out_desc.origin_shape.len() != 4 || out_desc.origin_format != Format::Nchw {
            return Ok(FusionStatus::NotChanged);
        }
        let [co, ci, kh, kw] = [
            out_desc.origin_shape[0],
            out_desc.origin_shape[1],
            out_desc.origin_shape[2],
            out_desc.origin_shape[3],
        ];
        if co % groups != 0 || ci % groups != 0 {
            return Ok(FusionStatus::NotChanged);
        }
        if editor.graph().consumers(grad, 0).is_empty() {
            return Err(FusionError::ParamInvalid(
                "gradient output has no consumers".to_string(),
            ));
        }

        let mask = group_mask([co, ci, kh, kw], groups);
        let mul = editor.insert_elementwise_mul(grad, 0, false)?;
        let mask_desc = TensorDesc::new(&[co, ci, kh, kw], Format::Nchw, DataType::Float16);
        let mask_name = format!("{}_group_mask", editor.graph().node_name(grad));
        let mask_const = editor.attach_const_input(mul, 1, &mask_name, mask_desc, mask)?;

        editor.mark_transformed(grad)?;
        new_nodes.extend([mul, mask_const]);
        Ok(FusionStatus::Changed)
    }
}
