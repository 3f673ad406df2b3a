//! Folds the divide-by-window-area of an `AvgPool` into constant multiplies.
//!
//! Three rewrite paths exist depending on dtype and padding:
//!
//! - fp16, uniform window (VALID-style): attach a depthwise filter constant
//!   whose every tap is `1 / (window_h * window_w)`. No extra node beyond the
//!   constant.
//! - fp16, non-uniform window (SAME-style): attach a filter of all ones, then
//!   splice a `Mul` behind the pool whose second operand is a per-position
//!   reciprocal-area coefficient matrix.
//! - int8 (quantized input): attach an all-ones int8 filter plus an int32
//!   kernel-sum bias correcting the quantization offset; the averaging divide
//!   is deferred to the downstream dequantize.

use crate::arith::kernel_element_count;
use crate::descriptor::{DataType, Format, TensorDesc, C0};
use crate::editor::GraphEditor;
use crate::geometry::is_uniform_window;
use crate::graph::{ConstData, Graph, NodeId};
use crate::optimize::{FusionError, FusionPass, FusionPattern, FusionStatus, Mapping};
use crate::weights::{
    int8_kernel_sums, offset_bias, position_coefficient_matrix, uniform_area_factor, AreaVariant,
    WindowGeometry,
};

use super::{same_padding, spatial_attr_pair};

/// Largest stride the pooling hardware accepts per spatial dim.
const MAX_STRIDE: i64 = 63;

/// Largest window area the pooling hardware accepts.
const MAX_WINDOW_AREA: i64 = 255;

pub struct AvgPoolFusion {
    /// Hardware ISA revision. Revision 1 applies the quantization offset in
    /// the matmul itself, so the synthesized bias is all zeros there.
    isa_arch_ver: i64,
}

impl AvgPoolFusion {
    pub fn new() -> AvgPoolFusion {
        AvgPoolFusion { isa_arch_ver: 0 }
    }

    pub fn with_isa_version(isa_arch_ver: i64) -> AvgPoolFusion {
        AvgPoolFusion { isa_arch_ver }
    }

    /// Depthwise filter constant in the tiled FractalZ layout: HWCN origin
    /// `[kh, kw, 1, c]`, every element `factor`.
    fn filter_const(
        editor: &mut GraphEditor<'_>,
        pool: NodeId,
        window: [i64; 2],
        channels: i64,
        factor: f32,
    ) -> Result<NodeId, FusionError> {
        let [window_h, window_w] = window;
        let c1 = (channels + C0 - 1) / C0;
        let physical = [c1 * window_h * window_w, 1, C0, C0];
        let count = kernel_element_count(1, &physical)?;

        let mut desc = TensorDesc::new(&physical, Format::FractalZ, DataType::Float16);
        desc.origin_shape = [window_h, window_w, 1, channels].as_slice().into();
        desc.origin_format = Format::Hwcn;

        let name = format!("{}_filter", editor.graph().node_name(pool));
        let data = uniform_area_factor(count as usize, factor);
        Ok(editor.attach_const_input(pool, 1, &name, desc, data)?)
    }

    fn fuse_fp16(
        &self,
        editor: &mut GraphEditor<'_>,
        pool: NodeId,
        geom: PoolGeometry,
        new_nodes: &mut Vec<NodeId>,
    ) -> Result<FusionStatus, FusionError> {
        let uniform = is_uniform_window(
            geom.input_hw[0],
            geom.input_hw[1],
            geom.window,
            geom.stride,
            geom.pad,
            false,
        );
        let window_area = geom.window[0] * geom.window[1];

        if uniform {
            let factor = 1.0 / window_area as f32;
            let filter = Self::filter_const(editor, pool, geom.window, geom.channels, factor)?;
            new_nodes.push(filter);
        } else {
            if editor.graph().consumers(pool, 0).is_empty() {
                return Err(FusionError::ParamInvalid(
                    "pooling output has no consumers".to_string(),
                ));
            }
            // Synthesize the coefficient matrix before the first mutation so
            // geometry failures leave the graph untouched.
            let c1 = (geom.channels + C0 - 1) / C0;
            let coeff_shape = [geom.batch, c1, geom.output_hw[0], geom.output_hw[1], C0];
            let coeff = position_coefficient_matrix(
                coeff_shape,
                &WindowGeometry {
                    window: geom.window,
                    stride: geom.stride,
                    pad: geom.pad,
                    input_hw: geom.input_hw,
                },
                false,
                AreaVariant::AvgPool,
            )?;

            let filter = Self::filter_const(editor, pool, geom.window, geom.channels, 1.0)?;
            let mul = editor.insert_elementwise_mul(pool, 0, true)?;
            let coeff_desc = TensorDesc::new(&coeff_shape, Format::Nc1hwc0, DataType::Float16);
            let coeff_name = format!("{}_coeff", editor.graph().node_name(pool));
            let coeff_const = editor.attach_const_input(mul, 1, &coeff_name, coeff_desc, coeff)?;
            new_nodes.extend([filter, mul, coeff_const]);
        }

        set_groups(editor, pool, geom.channels)?;
        editor.mark_transformed(pool)?;
        Ok(FusionStatus::Changed)
    }

    fn fuse_int8(
        &self,
        editor: &mut GraphEditor<'_>,
        pool: NodeId,
        geom: PoolGeometry,
        new_nodes: &mut Vec<NodeId>,
    ) -> Result<FusionStatus, FusionError> {
        let [window_h, window_w] = geom.window;
        if !is_uniform_window(
            geom.input_hw[0],
            geom.input_hw[1],
            geom.window,
            geom.stride,
            geom.pad,
            false,
        ) {
            // Padded int8 pooling needs position-dependent requant scales,
            // which the deferred-divide rewrite cannot express.
            return Ok(FusionStatus::NotChanged);
        }

        // Offset baked into the input representation by the upstream quantize.
        let offset = match editor.graph().producer(pool, 0) {
            Some(src) => {
                let src_node = editor
                    .graph()
                    .get(src.node)
                    .ok_or_else(|| FusionError::ParamInvalid("producer removed".to_string()))?;
                src_node
                    .desc()
                    .float_attr("offset_x")
                    .map(|v| v as i8)
                    .or_else(|| src_node.desc().int_attr("offset_x").map(|v| v as i8))
                    .unwrap_or(0)
            }
            None => 0,
        };

        // The averaging divide is handed to the downstream dequantize; the
        // rewrite is not applicable without one.
        let dequant = editor
            .graph()
            .consumers(pool, 0)
            .into_iter()
            .map(|(id, _)| id)
            .find(|&id| {
                editor
                    .graph()
                    .get(id)
                    .map(|n| n.op_type() == "AscendDequant")
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                FusionError::ParamInvalid("no dequantize consumer for int8 pooling".to_string())
            })?;

        let ones = vec![1i8; (window_h * window_w * geom.channels) as usize];
        let sums = int8_kernel_sums(&ones, [1, geom.channels, window_h, window_w])?;
        let bias = offset_bias(&sums, offset, self.isa_arch_ver);

        let filter_desc = {
            let mut desc = TensorDesc::new(
                &[window_h, window_w, 1, geom.channels],
                Format::Hwcn,
                DataType::Int8,
            );
            desc.format = Format::FractalZ;
            desc
        };
        let filter_name = format!("{}_filter", editor.graph().node_name(pool));
        let filter = editor.attach_const_input(
            pool,
            1,
            &filter_name,
            filter_desc,
            ConstData::I8(ones),
        )?;

        let bias_desc = TensorDesc::new(&[geom.channels], Format::Nd, DataType::Int32);
        let bias_name = format!("{}_bias", editor.graph().node_name(pool));
        let bias_const =
            editor.attach_const_input(pool, 2, &bias_name, bias_desc, ConstData::I32(bias))?;

        apply_area_factor_to_dequant(editor, dequant, 1.0 / (window_h * window_w) as f32)?;

        set_groups(editor, pool, geom.channels)?;
        editor.mark_transformed(pool)?;
        new_nodes.extend([filter, bias_const]);
        Ok(FusionStatus::Changed)
    }
}

impl Default for AvgPoolFusion {
    fn default() -> Self {
        AvgPoolFusion::new()
    }
}

/// Window geometry read off the matched node.
#[derive(Copy, Clone)]
struct PoolGeometry {
    batch: i64,
    channels: i64,
    input_hw: [i64; 2],
    output_hw: [i64; 2],
    window: [i64; 2],
    stride: [i64; 2],
    pad: [i64; 4],
}

fn set_groups(
    editor: &mut GraphEditor<'_>,
    node: NodeId,
    groups: i64,
) -> Result<(), FusionError> {
    let node = editor
        .graph_mut()
        .get_mut(node)
        .ok_or_else(|| FusionError::Failed("node removed".to_string()))?;
    node.desc_mut()
        .set_attr("groups", crate::descriptor::AttrValue::Int(groups));
    Ok(())
}

/// Fold the deferred averaging divide into the dequantize: scale its constant
/// scale input in place when there is one, otherwise set the `area_factor`
/// attribute for host-side deferred scaling.
fn apply_area_factor_to_dequant(
    editor: &mut GraphEditor<'_>,
    dequant: NodeId,
    factor: f32,
) -> Result<(), FusionError> {
    let scale_const = editor.graph().producer(dequant, 1).and_then(|src| {
        let node = editor.graph().get(src.node)?;
        if node.op_type() == "Const" {
            Some(src.node)
        } else {
            None
        }
    });
    if let Some(const_id) = scale_const {
        let const_node = editor
            .graph_mut()
            .get_mut(const_id)
            .ok_or_else(|| FusionError::Failed("scale constant removed".to_string()))?;
        if let Some(ConstData::F32(scale)) = const_node.desc_mut().weight.as_mut() {
            for v in scale.iter_mut() {
                *v *= factor;
            }
            return Ok(());
        }
    }
    let node = editor
        .graph_mut()
        .get_mut(dequant)
        .ok_or_else(|| FusionError::Failed("dequantize removed".to_string()))?;
    node.desc_mut()
        .set_attr("area_factor", crate::descriptor::AttrValue::Float(factor));
    Ok(())
}

impl FusionPass for AvgPoolFusion {
    fn name(&self) -> &str {
        "AvgPoolFusion"
    }

    fn patterns(&self) -> Vec<FusionPattern> {
        vec![FusionPattern::new("avg_pool").with_op("pool", &["AvgPool"])]
    }

    fn fuse(
        &mut self,
        graph: &mut Graph,
        mapping: &Mapping,
        new_nodes: &mut Vec<NodeId>,
    ) -> Result<FusionStatus, FusionError> {
        let pool = mapping
            .node("pool")
            .ok_or_else(|| FusionError::ParamInvalid("pool anchor missing".to_string()))?;
        let mut editor = GraphEditor::new(graph);
        if editor.is_transformed(pool) {
            return Ok(FusionStatus::NotChanged);
        }

        let (in_desc, out_desc, window, stride, padding) = {
            let node = editor
                .graph()
                .get(pool)
                .ok_or_else(|| FusionError::ParamInvalid("node removed".to_string()))?;
            let in_desc = node
                .desc()
                .input_descs
                .first()
                .cloned()
                .ok_or_else(|| FusionError::ParamInvalid("missing input descriptor".to_string()))?;
            let out_desc = node.desc().output_descs.first().cloned().ok_or_else(|| {
                FusionError::ParamInvalid("missing output descriptor".to_string())
            })?;
            let window = spatial_attr_pair(node.desc(), "ksize")?;
            let stride = spatial_attr_pair(node.desc(), "strides")?;
            let padding = node
                .desc()
                .str_attr("padding")
                .ok_or_else(|| FusionError::ParamInvalid("missing padding attribute".to_string()))?
                .to_string();
            (in_desc, out_desc, window, stride, padding)
        };

        // A zero or negative stride would divide by zero in the padding and
        // output-extent arithmetic below.
        if window[0] < 1 || window[1] < 1 || stride[0] < 1 || stride[1] < 1 {
            return Err(FusionError::ParamInvalid(format!(
                "non-positive ksize [{}, {}] or strides [{}, {}]",
                window[0], window[1], stride[0], stride[1]
            )));
        }

        if in_desc.origin_shape.len() != 4 {
            return Ok(FusionStatus::NotChanged);
        }
        let (Some(batch), Some(channels), Some(input_h), Some(input_w)) = (
            in_desc.batch(),
            in_desc.channels(),
            in_desc.height(),
            in_desc.width(),
        ) else {
            return Ok(FusionStatus::NotChanged);
        };
        let (Some(output_h), Some(output_w)) = (out_desc.height(), out_desc.width()) else {
            return Ok(FusionStatus::NotChanged);
        };

        // Dynamic (-1) dims cannot be baked into constants.
        if [batch, channels, input_h, input_w, output_h, output_w]
            .iter()
            .any(|&dim| dim <= 0)
        {
            return Ok(FusionStatus::NotChanged);
        }

        // Global pooling is already optimal.
        if output_w == 1 {
            return Ok(FusionStatus::NotChanged);
        }
        if stride[0] > MAX_STRIDE || stride[1] > MAX_STRIDE {
            return Ok(FusionStatus::NotChanged);
        }
        if window[0] * window[1] > MAX_WINDOW_AREA {
            return Ok(FusionStatus::NotChanged);
        }

        let pad = match padding.as_str() {
            "VALID" => [0; 4],
            "SAME" => {
                let [top, bottom] = same_padding(input_h, window[0], stride[0]);
                let [left, right] = same_padding(input_w, window[1], stride[1]);
                [top, bottom, left, right]
            }
            other => {
                return Err(FusionError::ParamInvalid(format!(
                    "unsupported padding mode \"{}\"",
                    other
                )))
            }
        };

        let geom = PoolGeometry {
            batch,
            channels,
            input_hw: [input_h, input_w],
            output_hw: [output_h, output_w],
            window,
            stride,
            pad,
        };

        let quantized = in_desc.dtype == DataType::Int8
            || editor
                .graph()
                .producer(pool, 0)
                .and_then(|src| editor.graph().get(src.node))
                .map(|n| n.op_type() == "AscendQuant")
                .unwrap_or(false);

        if quantized {
            self.fuse_int8(&mut editor, pool, geom, new_nodes)
        } else {
            self.fuse_fp16(&mut editor, pool, geom, new_nodes)
        }
    }
}
