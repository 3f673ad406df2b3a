//! Declarative patterns binding labeled operator anchors to graph nodes.
//!
//! A pattern is a chain of anchors. The first anchor matches any node whose
//! operator type is in its set; each following anchor must match the producer
//! feeding input 0 of the previously matched node. Passes that need richer
//! topology checks do them inside their fuse step, against the live graph.

use rustc_hash::FxHashMap;

use crate::graph::{Graph, NodeId};

struct Anchor {
    label: String,
    op_types: Vec<String>,
}

/// A named subgraph shape to search for.
pub struct FusionPattern {
    name: String,
    anchors: Vec<Anchor>,
}

impl FusionPattern {
    pub fn new(name: &str) -> FusionPattern {
        FusionPattern {
            name: name.to_string(),
            anchors: Vec::new(),
        }
    }

    /// Add an anchor matching any of `op_types`, bound in matches under
    /// `label`. The first anchor added is the chain head; later anchors walk
    /// up through input 0.
    pub fn with_op(mut self, label: &str, op_types: &[&str]) -> FusionPattern {
        self.anchors.push(Anchor {
            label: label.to_string(),
            op_types: op_types.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Binding of pattern labels to graph nodes for one match.
pub struct Mapping {
    pattern: String,
    nodes: FxHashMap<String, NodeId>,
}

impl Mapping {
    pub fn pattern_name(&self) -> &str {
        &self.pattern
    }

    /// Node bound to `label`, if the label exists in the pattern.
    pub fn node(&self, label: &str) -> Option<NodeId> {
        self.nodes.get(label).copied()
    }

    /// IDs of every bound node.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.values().copied()
    }
}

/// Find every occurrence of `pattern` in `graph`.
///
/// Matches are collected against a graph snapshot; callers mutating the graph
/// between matches must re-check that the bound nodes still exist.
pub fn find_matches(graph: &Graph, pattern: &FusionPattern) -> Vec<Mapping> {
    let Some(head) = pattern.anchors.first() else {
        return Vec::new();
    };
    let mut matches = Vec::new();
    for (id, node) in graph.iter() {
        if !head.op_types.iter().any(|t| t == node.op_type()) {
            continue;
        }
        let mut nodes = FxHashMap::default();
        nodes.insert(head.label.clone(), id);

        let mut current = id;
        let mut complete = true;
        for anchor in &pattern.anchors[1..] {
            let Some(producer) = graph.producer(current, 0) else {
                complete = false;
                break;
            };
            let Some(producer_node) = graph.get(producer.node) else {
                complete = false;
                break;
            };
            if !anchor.op_types.iter().any(|t| t == producer_node.op_type()) {
                complete = false;
                break;
            }
            nodes.insert(anchor.label.clone(), producer.node);
            current = producer.node;
        }
        if complete {
            matches.push(Mapping {
                pattern: pattern.name.to_string(),
                nodes,
            });
        }
    }
    matches
}
