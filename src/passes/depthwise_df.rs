//! Switches a depthwise filter-gradient to fp32 accumulation.
//!
//! fp16 accumulation of the filter gradient loses precision over large
//! spatial reductions. The rewrite flips the `DepthwiseConv2DBackpropFilterD`
//! output descriptor to fp32 and splices a `Cast` back to fp16 in front of
//! the original consumers, so the rest of the graph is unaffected.

use crate::descriptor::{AttrValue, DataType};
use crate::editor::GraphEditor;
use crate::graph::{Graph, NodeId};
use crate::optimize::{FusionError, FusionPass, FusionPattern, FusionStatus, Mapping};

pub struct DepthwiseDfFusion;

impl DepthwiseDfFusion {
    pub fn new() -> DepthwiseDfFusion {
        DepthwiseDfFusion
    }
}

impl Default for DepthwiseDfFusion {
    fn default() -> Self {
        DepthwiseDfFusion::new()
    }
}

impl FusionPass for DepthwiseDfFusion {
    fn name(&self) -> &str {
        "DepthwiseDfFusion"
    }

    fn patterns(&self) -> Vec<FusionPattern> {
        vec![FusionPattern::new("depthwise_filter_grad")
            .with_op("grad", &["DepthwiseConv2DBackpropFilterD"])]
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

        {
            let node = editor
                .graph()
                .get(grad)
                .ok_or_else(|| FusionError::ParamInvalid("node removed".to_string()))?;
            let out_desc = node.desc().output_descs.first().ok_or_else(|| {
                FusionError::ParamInvalid("missing output descriptor".to_string())
            })?;
            if out_desc.dtype != DataType::Float16 {
                return Ok(FusionStatus::NotChanged);
            }
        }
        if editor.graph().consumers(grad, 0).is_empty() {
            return Err(FusionError::ParamInvalid(
                "gradient output has no consumers".to_string(),
            ));
        }

        // The Cast copies the still-fp16 descriptors; its input side is then
        // flipped to fp32 together with the gradient output.
        let cast_name = format!("{}_cast", editor.graph().node_name(grad));
        let cast = editor.insert_after(grad, 0, &cast_name, "Cast")?;
        {
            let node = editor
                .graph_mut()
                .get_mut(grad)
                .ok_or_else(|| FusionError::Failed("node removed".to_string()))?;
            node.desc_mut().output_descs[0].dtype = DataType::Float32;
        }
        {
            let node = editor
                .graph_mut()
                .get_mut(cast)
                .ok_or_else(|| FusionError::Failed("cast removed".to_string()))?;
            node.desc_mut().input_descs[0].dtype = DataType::Float32;
            node.desc_mut()
                .set_attr("dst_type", AttrValue::Str("float16".to_string()));
        }

        editor.mark_transformed(grad)?;
        new_nodes.push(cast);
        Ok(FusionStatus::Changed)
    }
}
