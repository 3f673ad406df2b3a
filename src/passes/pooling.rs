//! Folds the averaging divide of the generic `Pooling` operator into a
//! spliced `Mul` with a per-position coefficient constant.
//!
//! Differs from the `AvgPool` rewrite in two ways: the receptive area at a
//! padded border clamps against `input + pad` rather than the plain input
//! extent, and coefficient constants are shared between the batch replicas a
//! multi-batch split produces from one original node.

use rustc_hash::FxHashMap;

use crate::descriptor::{AttrValue, DataType, Format, TensorDesc, C0};
use crate::editor::GraphEditor;
use crate::geometry::{is_uniform_window, pooling_output_extent};
use crate::graph::{ConstData, Graph, NodeId};
use crate::optimize::{FusionError, FusionPass, FusionPattern, FusionStatus, Mapping};
use crate::weights::{
    position_coefficient_matrix, uniform_area_factor, AreaVariant, WindowGeometry,
};

/// Averaging mode of the `Pooling` operator's `mode` attribute.
const MODE_AVG: i64 = 1;

/// Suffix appended to a node name by the host's multi-batch split. Replicas
/// of one original node share a coefficient constant, keyed by the name with
/// this suffix stripped.
const BATCH_REPLICA_SUFFIX: &str = "_mbatch_batch";

pub struct PoolingFusion {
    /// Coefficient constants already created this sweep, keyed by the
    /// matched node's input name stripped of its batch-replica suffix.
    mul_const_cache: FxHashMap<String, NodeId>,
}

impl PoolingFusion {
    pub fn new() -> PoolingFusion {
        PoolingFusion {
            mul_const_cache: FxHashMap::default(),
        }
    }

    fn cache_key(graph: &Graph, pool: NodeId) -> String {
        let name = match graph.producer(pool, 0) {
            Some(src) => graph.node_name(src.node),
            None => graph.node_name(pool),
        };
        match name.find(BATCH_REPLICA_SUFFIX) {
            Some(pos) => name[..pos].to_string(),
            None => name,
        }
    }
}

impl Default for PoolingFusion {
    fn default() -> Self {
        PoolingFusion::new()
    }
}

impl FusionPass for PoolingFusion {
    fn name(&self) -> &str {
        "PoolingFusion"
    }

    fn patterns(&self) -> Vec<FusionPattern> {
        vec![FusionPattern::new("pooling").with_op("pool", &["Pooling", "PoolingD"])]
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

        let (in_desc, window, stride, pad, ceil_mode) = {
            let node = editor
                .graph()
                .get(pool)
                .ok_or_else(|| FusionError::ParamInvalid("node removed".to_string()))?;
            let desc = node.desc();
            if desc.int_attr("mode").unwrap_or(0) != MODE_AVG {
                return Ok(FusionStatus::NotChanged);
            }
            if desc.bool_attr("global_pooling") == Some(true) {
                return Ok(FusionStatus::NotChanged);
            }
            let in_desc = desc
                .input_descs
                .first()
                .cloned()
                .ok_or_else(|| FusionError::ParamInvalid("missing input descriptor".to_string()))?;
            let window = list_pair(desc.int_list_attr("window"), "window")?;
            let stride = list_pair(desc.int_list_attr("stride"), "stride")?;
            let pad = desc
                .int_list_attr("pad")
                .filter(|p| p.len() == 4)
                .map(|p| [p[0], p[1], p[2], p[3]])
                .unwrap_or([0; 4]);
            let ceil_mode = desc.bool_attr("ceil_mode").unwrap_or(false);
            (in_desc, window, stride, pad, ceil_mode)
        };

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

        // Dynamic (-1) dims cannot be baked into constants.
        if batch <= 0 || channels <= 0 || input_h <= 0 || input_w <= 0 {
            return Ok(FusionStatus::NotChanged);
        }

        // A zero or negative stride would divide by zero in the output-extent
        // arithmetic below.
        let [window_h, window_w] = window;
        if window_h < 1 || window_w < 1 || stride[0] < 1 || stride[1] < 1 {
            return Err(FusionError::ParamInvalid(format!(
                "non-positive window [{}, {}] or stride [{}, {}]",
                window_h, window_w, stride[0], stride[1]
            )));
        }
        let window_area = window_h * window_w;
        let is_int8 = in_desc.dtype == DataType::Int8;

        if is_uniform_window(input_h, input_w, window, stride, pad, ceil_mode) {
            let count = (channels * window_area) as usize;
            let factor = if is_int8 { 1.0 } else { 1.0 / window_area as f32 };
            let mut desc =
                TensorDesc::new(&[window_h, window_w, 1, channels], Format::Hwcn, in_desc.dtype);
            desc.format = Format::FractalZ;
            let data = if is_int8 {
                ConstData::I8(vec![1; count])
            } else {
                uniform_area_factor(count, factor)
            };
            let name = format!("{}_filter", editor.graph().node_name(pool));
            let filter = editor.attach_const_input(pool, 1, &name, desc, data)?;
            set_groups(&mut editor, pool, channels)?;
            editor.mark_transformed(pool)?;
            new_nodes.push(filter);
            return Ok(FusionStatus::Changed);
        }

        if editor.graph().consumers(pool, 0).is_empty() {
            return Err(FusionError::ParamInvalid(
                "pooling output has no consumers".to_string(),
            ));
        }

        let out_h = pooling_output_extent(input_h, pad[0], pad[1], window_h, stride[0], ceil_mode);
        let out_w = pooling_output_extent(input_w, pad[2], pad[3], window_w, stride[1], ceil_mode);
        let c1 = (channels + C0 - 1) / C0;
        let coeff_shape = [batch, c1, out_h, out_w, C0];

        let key = Self::cache_key(editor.graph(), pool);
        let cached = self
            .mul_const_cache
            .get(&key)
            .copied()
            .filter(|&id| editor.graph().get(id).is_some());

        // Coefficients are built before the first mutation; an overflow here
        // leaves the graph untouched.
        let coeff = match cached {
            Some(_) => None,
            None => Some(position_coefficient_matrix(
                coeff_shape,
                &WindowGeometry {
                    window,
                    stride,
                    pad,
                    input_hw: [input_h, input_w],
                },
                is_int8,
                AreaVariant::Pooling,
            )?),
        };

        let mul = editor.insert_elementwise_mul(pool, 0, true)?;
        match (cached, coeff) {
            (Some(const_id), _) => {
                editor.attach_existing_input(mul, 1, crate::graph::OutputRef {
                    node: const_id,
                    port: 0,
                })?;
                new_nodes.push(mul);
            }
            (None, Some(data)) => {
                let desc = TensorDesc::new(&coeff_shape, Format::Nc1hwc0, DataType::Float16);
                let name = format!("{}_coeff", key);
                let coeff_const = editor.attach_const_input(mul, 1, &name, desc, data)?;
                self.mul_const_cache.insert(key, coeff_const);
                new_nodes.extend([mul, coeff_const]);
            }
            (None, None) => unreachable!(),
        }

        set_groups(&mut editor, pool, channels)?;
        editor.mark_transformed(pool)?;
        Ok(FusionStatus::Changed)
    }
}

fn list_pair(list: Option<&[i64]>, attr: &str) -> Result<[i64; 2], FusionError> {
    match list {
        Some(&[h, w]) => Ok([h, w]),
        _ => Err(FusionError::ParamInvalid(format!(
            "missing or malformed {} attribute",
            attr
        ))),
    }
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
    node.desc_mut().set_attr("groups", AttrValue::Int(groups));
    Ok(())
}
