//! Propagates the depthwise channel fold through the neighborhood of the
//! filter.
//!
//! The depthwise hardware path wants activations shaped `[n * c, 1, h, w]`
//! rather than `[n, c, h, w]`. Every node reachable from the depthwise
//! filter's producer within a fixed hop budget gets its NCHW descriptors
//! folded, walking both producer and consumer edges. Reconvergent paths and
//! repeat sweeps are cut off by the per-node transformed marker, and a node
//! already carrying a single channel stops its branch outright.

use crate::descriptor::{AttrValue, Format};
use crate::editor::TRANSFORMED_ATTR;
use crate::graph::{Graph, NodeId};
use crate::optimize::{FusionError, FusionPass, FusionPattern, FusionStatus, Mapping};

/// Most hops the walk takes from the filter producer.
const HOP_BUDGET: u32 = 12;

pub struct DepthwiseChannelSwap;

impl DepthwiseChannelSwap {
    pub fn new() -> DepthwiseChannelSwap {
        DepthwiseChannelSwap
    }
}

impl Default for DepthwiseChannelSwap {
    fn default() -> Self {
        DepthwiseChannelSwap::new()
    }
}

enum SwapOutcome {
    /// At least one descriptor was folded.
    Swapped,
    /// No NCHW descriptor present; nothing to do at this node.
    Nothing,
    /// A descriptor already has a single channel; the branch is done.
    Sentinel,
}

/// Fold every 4-D NCHW descriptor of `node` from `[n, c, h, w]` to
/// `[n * c, 1, h, w]`.
fn swap_node_descriptors(graph: &mut Graph, node: NodeId) -> Result<SwapOutcome, FusionError> {
    let node = graph
        .get_mut(node)
        .ok_or_else(|| FusionError::Failed("node removed during walk".to_string()))?;
    let desc = node.desc_mut();

    let mut any_nchw = false;
    for d in desc.input_descs.iter().chain(desc.output_descs.iter()) {
        if d.origin_format == Format::Nchw && d.origin_shape.len() == 4 {
            any_nchw = true;
            if d.origin_shape[1] == 1 {
                return Ok(SwapOutcome::Sentinel);
            }
        }
    }
    if !any_nchw {
        return Ok(SwapOutcome::Nothing);
    }

    for d in desc
        .input_descs
        .iter_mut()
        .chain(desc.output_descs.iter_mut())
    {
        if d.origin_format == Format::Nchw && d.origin_shape.len() == 4 {
            let folded = [
                d.origin_shape[0] * d.origin_shape[1],
                1,
                d.origin_shape[2],
                d.origin_shape[3],
            ];
            d.set_origin_shape(&folded);
        }
    }
    Ok(SwapOutcome::Swapped)
}

fn is_marked(graph: &Graph, node: NodeId) -> bool {
    graph
        .get(node)
        .map(|n| n.desc().bool_attr(TRANSFORMED_ATTR) == Some(true))
        .unwrap_or(false)
}

fn mark(graph: &mut Graph, node: NodeId) -> Result<(), FusionError> {
    let node = graph
        .get_mut(node)
        .ok_or_else(|| FusionError::Failed("node removed during walk".to_string()))?;
    node.desc_mut().set_attr(TRANSFORMED_ATTR, AttrValue::Bool(true));
    Ok(())
}

/// Recursive walk over producers and consumers with `budget` hops left.
/// Returns whether any descriptor was folded below this point.
fn walk(graph: &mut Graph, node: NodeId, budget: u32) -> Result<bool, FusionError> {
    if budget == 0 || is_marked(graph, node) {
        return Ok(false);
    }
    let mut changed = match swap_node_descriptors(graph, node)? {
        SwapOutcome::Swapped => true,
        SwapOutcome::Nothing => false,
        SwapOutcome::Sentinel => return Ok(false),
    };
    mark(graph, node)?;

    let mut neighbors: Vec<NodeId> = Vec::new();
    {
        let n = graph
            .get(node)
            .ok_or_else(|| FusionError::Failed("node removed during walk".to_string()))?;
        neighbors.extend(n.inputs().iter().flatten().map(|edge| edge.node));
        let n_outputs = n.desc().output_descs.len();
        for port in 0..n_outputs {
            neighbors.extend(graph.consumers(node, port).into_iter().map(|(id, _)| id));
        }
    }
    for neighbor in neighbors {
        changed |= walk(graph, neighbor, budget - 1)?;
    }
    Ok(changed)
}

impl FusionPass for DepthwiseChannelSwap {
    fn name(&self) -> &str {
        "DepthwiseChannelSwap"
    }

    fn patterns(&self) -> Vec<FusionPattern> {
        vec![FusionPattern::new("depthwise_channel_swap")
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
        let filter_src = match graph.producer(conv, 1) {
            Some(src) => src.node,
            None => return Ok(FusionStatus::NotChanged),
        };
        if walk(graph, filter_src, HOP_BUDGET)? {
            Ok(FusionStatus::Changed)
        } else {
            Ok(FusionStatus::NotChanged)
        }
    }
}
