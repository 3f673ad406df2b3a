//! Refolds a depthwise convolution's filter from HWCN `[kh, kw, c, m]` into
//! `[kh, kw, 1, c * m]` so the hardware can treat it as a grouped convolution
//! with `c` groups.
//!
//! The fold is multiplier-major: output channel `m * c_total + c` takes the
//! tap of input channel `c`, multiplier `m`, so a constant filter's payload
//! is genuinely transposed, not just reshaped.

use crate::editor::GraphEditor;
use crate::graph::{ConstData, Graph, NodeId};
use crate::optimize::{FusionError, FusionPass, FusionPattern, FusionStatus, Mapping};

pub struct DepthwiseDwMulFusion;

impl DepthwiseDwMulFusion {
    pub fn new() -> DepthwiseDwMulFusion {
        DepthwiseDwMulFusion
    }
}

impl Default for DepthwiseDwMulFusion {
    fn default() -> Self {
        DepthwiseDwMulFusion::new()
    }
}

/// Transpose the trailing `[c, m]` axes of an HWCN tap buffer to `[m, c]`
/// while flattening them into one axis.
fn refold<T: Copy>(taps: &[T], dims: [i64; 4]) -> Vec<T> {
    let [kh, kw, c, m] = [
        dims[0] as usize,
        dims[1] as usize,
        dims[2] as usize,
        dims[3] as usize,
    ];
    let mut out = Vec::with_capacity(taps.len());
    for hw in 0..kh * kw {
        let base = hw * c * m;
        for m_i in 0..m {
            for c_i in 0..c {
                out.push(taps[base + c_i * m + m_i]);
            }
        }
    }
    out
}

fn refold_payload(payload: &ConstData, dims: [i64; 4]) -> ConstData {
    match payload {
        ConstData::F16(v) => ConstData::F16(refold(v, dims)),
        ConstData::F32(v) => ConstData::F32(refold(v, dims)),
        ConstData::I8(v) => ConstData::I8(refold(v, dims)),
        ConstData::I32(v) => ConstData::I32(refold(v, dims)),
    }
}

impl FusionPass for DepthwiseDwMulFusion {
    fn name(&self) -> &str {
        "DepthwiseDwMulFusion"
    }

    fn patterns(&self) -> Vec<FusionPattern> {
        vec![FusionPattern::new("depthwise_conv")
            .with_op("conv", &["DepthwiseConv2D", "DepthwiseConv2dNative"])]
    }

    fn fuse(
        &mut self,
        graph: &mut Graph,
        mapping: &Mapping,
        _new_nodes: &mut Vec<NodeId>,
    ) -> Result<FusionStatus, FusionError> {
        let conv = mapping
            .node("conv")
            .ok_or_else(|| FusionError::ParamInvalid("conv anchor missing".to_string()))?;
        let mut editor = GraphEditor::new(graph);
        if editor.is_transformed(conv) {
            return Ok(FusionStatus::NotChanged);
        }

        let filter_src = editor.graph().producer(conv, 1).ok_or_else(|| {
            FusionError::ParamInvalid("depthwise filter input unconnected".to_string())
        })?;
        let filter_desc = {
            let node = editor
                .graph()
                .get(conv)
                .ok_or_else(|| FusionError::ParamInvalid("node removed".to_string()))?;
            node.desc()
                .input_descs
                .get(1)
                .cloned()
                .ok_or_else(|| FusionError::ParamInvalid("missing filter descriptor".to_string()))?
        };

        if filter_desc.origin_shape.len() != 4
            || filter_desc.origin_format != crate::descriptor::Format::Hwcn
        {
            return Ok(FusionStatus::NotChanged);
        }
        let dims = [
            filter_desc.origin_shape[0],
            filter_desc.origin_shape[1],
            filter_desc.origin_shape[2],
            filter_desc.origin_shape[3],
        ];
        let [kh, kw, c, m] = dims;
        // One input channel is already in the target layout.
        if c == 1 {
            return Ok(FusionStatus::NotChanged);
        }

        let folded = [kh, kw, 1, c * m];

        // Update the filter descriptor on both sides of the edge, and
        // transpose the payload when the producer is a constant.
        {
            let node = editor
                .graph_mut()
                .get_mut(conv)
                .ok_or_else(|| FusionError::Failed("node removed".to_string()))?;
            node.desc_mut().input_descs[1].set_origin_shape(&folded);
        }
        {
            let producer = editor
                .graph_mut()
                .get_mut(filter_src.node)
                .ok_or_else(|| FusionError::Failed("filter producer removed".to_string()))?;
            let desc = producer
                .desc_mut()
                .output_descs
                .get_mut(filter_src.port)
                .ok_or_else(|| FusionError::Failed("filter output missing".to_string()))?;
            desc.set_origin_shape(&folded);
            if producer.op_type() == "Const" {
                let refolded = producer
                    .desc()
                    .weight
                    .as_ref()
                    .map(|payload| refold_payload(payload, dims));
                if let Some(refolded) = refolded {
                    producer.desc_mut().weight = Some(refolded);
                }
            }
        }

        {
            let node = editor
                .graph_mut()
                .get_mut(conv)
                .ok_or_else(|| FusionError::Failed("node removed".to_string()))?;
            node.desc_mut()
                .set_attr("groups", crate::descriptor::AttrValue::Int(c));
        }
        editor.mark_transformed(conv)?;
        Ok(FusionStatus::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::{refold, DepthwiseDwMulFusion};
    use crate::descriptor::{DataType, Format, TensorDesc};
    use crate::graph::{ConstData, Graph, NodeId, OpDesc};
    use crate::optimize::{find_matches, FusionPass, FusionStatus};

    fn depthwise_graph(c: i64, m: i64, taps: Option<Vec<f32>>) -> (Graph, NodeId, NodeId) {
        let mut g = Graph::new();
        let filter_desc = TensorDesc::new(&[2, 2, c, m], Format::Hwcn, DataType::Float32);
        let value_desc = TensorDesc::new(&[1, c, 8, 8], Format::Nchw, DataType::Float16);

        let mut filter_op = OpDesc::new("filter", "Const").with_output(filter_desc.clone());
        if let Some(taps) = taps {
            filter_op = filter_op.with_weight(ConstData::F32(taps));
        }
        let filter = g.add_node(filter_op).unwrap();
        let conv = g
            .add_node(
                OpDesc::new("conv", "DepthwiseConv2D")
                    .with_input(value_desc.clone())
                    .with_input(filter_desc)
                    .with_output(value_desc),
            )
            .unwrap();
        g.connect(filter, 0, conv, 1).unwrap();
        (g, conv, filter)
    }

    fn run_on(graph: &mut Graph, pass: &mut DepthwiseDwMulFusion) -> FusionStatus {
        let pattern = pass.patterns().remove(0);
        let matches = find_matches(graph, &pattern);
        assert_eq!(matches.len(), 1);
        pass.fuse(graph, &matches[0], &mut Vec::new()).unwrap()
    }

    #[test]
    fn test_refold_is_multiplier_major() {
        // kh = kw = 1, c = 3, m = 2: input [c0m0, c0m1, c1m0, c1m1, c2m0,
        // c2m1], output channel order m-major.
        let taps = [0.0, 1.0, 10.0, 11.0, 20.0, 21.0];
        let folded = refold(&taps, [1, 1, 3, 2]);
        assert_eq!(folded, [0.0, 10.0, 20.0, 1.0, 11.0, 21.0]);
    }

    #[test]
    fn test_filter_descriptor_and_payload_folded() {
        // 2x2 kernel, c = 2, m = 2; taps numbered hw * 100 + c * 10 + m.
        let mut taps = Vec::new();
        for hw in 0..4 {
            for c in 0..2 {
                for m in 0..2 {
                    taps.push((hw * 100 + c * 10 + m) as f32);
                }
            }
        }
        let (mut g, conv, filter) = depthwise_graph(2, 2, Some(taps));

        let status = run_on(&mut g, &mut DepthwiseDwMulFusion::new());
        assert_eq!(status, FusionStatus::Changed);

        let conv_node = g.get(conv).unwrap();
        assert_eq!(
            conv_node.desc().input_descs[1].origin_shape.as_slice(),
            [2, 2, 1, 4]
        );
        assert_eq!(conv_node.desc().int_attr("groups"), Some(2));

        let filter_node = g.get(filter).unwrap();
        assert_eq!(
            filter_node.desc().output_descs[0].origin_shape.as_slice(),
            [2, 2, 1, 4]
        );
        let ConstData::F32(folded) = filter_node.desc().weight.as_ref().unwrap() else {
            panic!("expected f32 filter");
        };
        // Per spatial position: [c0m0, c1m0, c0m1, c1m1].
        assert_eq!(&folded[0..4], [0.0, 10.0, 1.0, 11.0]);
        assert_eq!(&folded[4..8], [100.0, 110.0, 101.0, 111.0]);
    }

    #[test]
    fn test_single_channel_sentinel() {
        let (mut g, conv, _) = depthwise_graph(1, 4, None);
        let status = run_on(&mut g, &mut DepthwiseDwMulFusion::new());
        assert_eq!(status, FusionStatus::NotChanged);
        assert_eq!(
            g.get(conv).unwrap().desc().input_descs[1]
                .origin_shape
                .as_slice(),
            [2, 2, 1, 4]
        );
    }

    #[test]
    fn test_idempotent() {
        let (mut g, _, filter) = depthwise_graph(2, 2, Some(vec![0.0; 16]));
        let mut pass = DepthwiseDwMulFusion::new();
        assert_eq!(run_on(&mut g, &mut pass), FusionStatus::Changed);

        let shape_after: Vec<i64> = g.get(filter).unwrap().desc().output_descs[0]
            .origin_shape
            .to_vec();
        assert_eq!(run_on(&mut g, &mut pass), FusionStatus::NotChanged);
        // A second application would have folded [2, 2, 1, 4] again.
        assert_eq!(
            g.get(filter).unwrap().desc().output_descs[0]
                .origin_shape
                .to_vec(),
            shape_after
        );
    }
}
