//! Mutable compute-graph object model operated on by the fusion passes.
//!
//! A graph owns a set of nodes, each carrying an [`OpDesc`] (name, operator
//! type, per-port tensor descriptors, attributes and an optional constant
//! payload). Edges are port-level: each node stores at most one producer per
//! input slot, and fan-out is derived by scanning consumers.

use std::error::Error;
use std::fmt;

use rustc_hash::FxHashMap;

use crate::descriptor::{AttrValue, TensorDesc};

mod node_id;

pub use node_id::NodeId;

/// Reference to one output port of a node: the producer side of an edge.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutputRef {
    pub node: NodeId,
    pub port: usize,
}

/// Raw constant payload owned by a `Const`-type node.
///
/// Payloads are created fresh per fusion application; they are never shared
/// between matches (with the one caching exception in the Pooling pass, which
/// shares the *node*, not the buffer).
#[derive(Clone, Debug, PartialEq)]
pub enum ConstData {
    F16(Vec<u16>),
    F32(Vec<f32>),
    I8(Vec<i8>),
    I32(Vec<i32>),
}

impl ConstData {
    pub fn len(&self) -> usize {
        match self {
            ConstData::F16(v) => v.len(),
            ConstData::F32(v) => v.len(),
            ConstData::I8(v) => v.len(),
            ConstData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Description of one operator node: identity, typed ports and attributes.
#[derive(Clone, Debug)]
pub struct OpDesc {
    name: String,
    op_type: String,
    pub input_descs: Vec<TensorDesc>,
    pub output_descs: Vec<TensorDesc>,
    attrs: FxHashMap<String, AttrValue>,
    pub weight: Option<ConstData>,
}

impl OpDesc {
    pub fn new(name: &str, op_type: &str) -> OpDesc {
        OpDesc {
            name: name.to_string(),
            op_type: op_type.to_string(),
            input_descs: Vec::new(),
            output_descs: Vec::new(),
            attrs: FxHashMap::default(),
            weight: None,
        }
    }

    pub fn with_input(mut self, desc: TensorDesc) -> OpDesc {
        self.input_descs.push(desc);
        self
    }

    pub fn with_output(mut self, desc: TensorDesc) -> OpDesc {
        self.output_descs.push(desc);
        self
    }

    pub fn with_weight(mut self, weight: ConstData) -> OpDesc {
        self.weight = Some(weight);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn set_op_type(&mut self, op_type: &str) {
        self.op_type = op_type.to_string();
    }

    pub fn set_attr(&mut self, name: &str, value: AttrValue) {
        self.attrs.insert(name.to_string(), value);
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        match self.attrs.get(name) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn int_list_attr(&self, name: &str) -> Option<&[i64]> {
        match self.attrs.get(name) {
            Some(AttrValue::IntList(v)) => Some(v),
            _ => None,
        }
    }

    pub fn float_attr(&self, name: &str) -> Option<f32> {
        match self.attrs.get(name) {
            Some(AttrValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn bool_attr(&self, name: &str) -> Option<bool> {
        match self.attrs.get(name) {
            Some(AttrValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn str_attr(&self, name: &str) -> Option<&str> {
        match self.attrs.get(name) {
            Some(AttrValue::Str(v)) => Some(v),
            _ => None,
        }
    }
}

/// A node in the graph: an [`OpDesc`] plus its input edges.
#[derive(Debug)]
pub struct Node {
    desc: OpDesc,
    inputs: Vec<Option<OutputRef>>,
}

impl Node {
    pub fn desc(&self) -> &OpDesc {
        &self.desc
    }

    pub fn desc_mut(&mut self) -> &mut OpDesc {
        &mut self.desc
    }

    pub fn name(&self) -> &str {
        self.desc.name()
    }

    pub fn op_type(&self) -> &str {
        self.desc.op_type()
    }

    /// Producer connected to input slot `port`, if any.
    pub fn input(&self, port: usize) -> Option<OutputRef> {
        self.inputs.get(port).copied().flatten()
    }

    pub fn inputs(&self) -> &[Option<OutputRef>] {
        &self.inputs
    }
}

/// Errors from graph construction and mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphError {
    /// A node with this name already exists; node identity is the name.
    DuplicateName(String),
    InvalidNode(NodeId),
    /// A port index is out of range for the node's descriptor list.
    InvalidPort { node: NodeId, port: usize },
    /// The consumer input slot already has a producer. The existing edge
    /// must be removed before redirecting, otherwise the graph would have
    /// two producers for one input.
    SlotOccupied { node: NodeId, port: usize },
    /// Disconnect of an input slot that has no producer.
    SlotEmpty { node: NodeId, port: usize },
    /// Removal of a node whose outputs still have consumers.
    NodeInUse(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::DuplicateName(name) => write!(f, "duplicate node name \"{}\"", name),
            GraphError::InvalidNode(id) => write!(f, "no node with ID {}", id),
            GraphError::InvalidPort { node, port } => {
                write!(f, "port {} out of range for node {}", port, node)
            }
            GraphError::SlotOccupied { node, port } => {
                write!(f, "input {} of node {} already has a producer", port, node)
            }
            GraphError::SlotEmpty { node, port } => {
                write!(f, "input {} of node {} has no producer", port, node)
            }
            GraphError::NodeInUse(name) => {
                write!(f, "node \"{}\" still has consumers", name)
            }
        }
    }
}

impl Error for GraphError {}

/// A directed compute graph with named nodes and port-level edges.
pub struct Graph {
    nodes: Vec<Option<Node>>,
    name_index: FxHashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            nodes: Vec::new(),
            name_index: FxHashMap::default(),
        }
    }

    /// Add a node to the graph. Its input slots start unconnected, one per
    /// entry in `desc.input_descs`.
    pub fn add_node(&mut self, desc: OpDesc) -> Result<NodeId, GraphError> {
        if self.name_index.contains_key(desc.name()) {
            return Err(GraphError::DuplicateName(desc.name().to_string()));
        }
        let id = NodeId::from_index(self.nodes.len());
        self.name_index.insert(desc.name().to_string(), id);
        let inputs = vec![None; desc.input_descs.len()];
        self.nodes.push(Some(Node { desc, inputs }));
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(|n| n.as_mut())
    }

    pub fn node_id_by_name(&self, name: &str) -> Option<NodeId> {
        self.name_index.get(name).copied()
    }

    /// Debug name for a node, falling back to the ID when it is gone.
    pub fn node_name(&self, id: NodeId) -> String {
        self.get(id)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| format!("[ID: {}]", id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId::from_index(i), n)))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes
            .iter()
            .flatten()
            .map(|n| n.inputs.iter().flatten().count())
            .sum()
    }

    /// Connect output `src_port` of `src` to input `dst_port` of `dst`.
    pub fn connect(
        &mut self,
        src: NodeId,
        src_port: usize,
        dst: NodeId,
        dst_port: usize,
    ) -> Result<(), GraphError> {
        {
            let src_node = self.get(src).ok_or(GraphError::InvalidNode(src))?;
            if src_port >= src_node.desc.output_descs.len() {
                return Err(GraphError::InvalidPort {
                    node: src,
                    port: src_port,
                });
            }
        }
        let dst_node = self.get_mut(dst).ok_or(GraphError::InvalidNode(dst))?;
        let slot = dst_node
            .inputs
            .get_mut(dst_port)
            .ok_or(GraphError::InvalidPort {
                node: dst,
                port: dst_port,
            })?;
        if slot.is_some() {
            return Err(GraphError::SlotOccupied {
                node: dst,
                port: dst_port,
            });
        }
        *slot = Some(OutputRef {
            node: src,
            port: src_port,
        });
        Ok(())
    }

    /// Remove the edge feeding input `dst_port` of `dst`, returning the
    /// producer it was connected to.
    pub fn disconnect(&mut self, dst: NodeId, dst_port: usize) -> Result<OutputRef, GraphError> {
        let dst_node = self.get_mut(dst).ok_or(GraphError::InvalidNode(dst))?;
        let slot = dst_node
            .inputs
            .get_mut(dst_port)
            .ok_or(GraphError::InvalidPort {
                node: dst,
                port: dst_port,
            })?;
        slot.take().ok_or(GraphError::SlotEmpty {
            node: dst,
            port: dst_port,
        })
    }

    /// Producer feeding input `port` of `node`.
    pub fn producer(&self, node: NodeId, port: usize) -> Option<OutputRef> {
        self.get(node).and_then(|n| n.input(port))
    }

    /// All `(consumer, input_port)` pairs fed by output `port` of `src`.
    pub fn consumers(&self, src: NodeId, port: usize) -> Vec<(NodeId, usize)> {
        let target = OutputRef { node: src, port };
        let mut out = Vec::new();
        for (id, node) in self.iter() {
            for (in_port, edge) in node.inputs.iter().enumerate() {
                if *edge == Some(target) {
                    out.push((id, in_port));
                }
            }
        }
        out
    }

    /// Remove a node. Fails while any consumer still references one of its
    /// outputs; the node's own input edges are dropped.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.get(id).ok_or(GraphError::InvalidNode(id))?;
        let n_outputs = node.desc.output_descs.len();
        let name = node.name().to_string();
        for port in 0..n_outputs {
            if !self.consumers(id, port).is_empty() {
                return Err(GraphError::NodeInUse(name));
            }
        }
        self.name_index.remove(&name);
        self.nodes[id.index()] = None;
        Ok(())
    }

    /// Add an input slot (and descriptor) to a node, returning its port.
    ///
    /// Used when a fusion attaches a new constant input to an existing node.
    pub fn append_input_slot(
        &mut self,
        node: NodeId,
        desc: TensorDesc,
    ) -> Result<usize, GraphError> {
        let node = self.get_mut(node).ok_or(GraphError::InvalidNode(node))?;
        node.desc.input_descs.push(desc);
        node.inputs.push(None);
        Ok(node.inputs.len() - 1)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Graph, GraphError, OpDesc};
    use crate::descriptor::{DataType, Format, TensorDesc};

    fn value_desc() -> TensorDesc {
        TensorDesc::new(&[1, 8, 4, 4], Format::Nchw, DataType::Float16)
    }

    fn unary_op(name: &str, op_type: &str) -> OpDesc {
        OpDesc::new(name, op_type)
            .with_input(value_desc())
            .with_output(value_desc())
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut g = Graph::new();
        g.add_node(unary_op("a", "Relu")).unwrap();
        let err = g.add_node(unary_op("a", "Relu")).unwrap_err();
        assert_eq!(err, GraphError::DuplicateName("a".to_string()));
    }

    #[test]
    fn test_connect_disconnect() {
        let mut g = Graph::new();
        let a = g.add_node(unary_op("a", "Relu")).unwrap();
        let b = g.add_node(unary_op("b", "Relu")).unwrap();
        let c = g.add_node(unary_op("c", "Relu")).unwrap();

        g.connect(a, 0, b, 0).unwrap();
        g.connect(a, 0, c, 0).unwrap();
        assert_eq!(g.consumers(a, 0), vec![(b, 0), (c, 0)]);
        assert_eq!(g.edge_count(), 2);

        // One producer per input slot: connecting again must fail until the
        // existing edge is removed.
        let err = g.connect(c, 0, b, 0).unwrap_err();
        assert_eq!(err, GraphError::SlotOccupied { node: b, port: 0 });
        g.disconnect(b, 0).unwrap();
        g.connect(c, 0, b, 0).unwrap();
        assert_eq!(g.producer(b, 0).unwrap().node, c);

        let err = g.disconnect(a, 0).unwrap_err();
        assert_eq!(err, GraphError::SlotEmpty { node: a, port: 0 });
    }

    #[test]
    fn test_invalid_ports() {
        let mut g = Graph::new();
        let a = g.add_node(unary_op("a", "Relu")).unwrap();
        let b = g.add_node(unary_op("b", "Relu")).unwrap();
        assert!(matches!(
            g.connect(a, 3, b, 0),
            Err(GraphError::InvalidPort { .. })
        ));
        assert!(matches!(
            g.connect(a, 0, b, 3),
            Err(GraphError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_remove_node_in_use() {
        let mut g = Graph::new();
        let a = g.add_node(unary_op("a", "Relu")).unwrap();
        let b = g.add_node(unary_op("b", "Relu")).unwrap();
        g.connect(a, 0, b, 0).unwrap();

        let err = g.remove_node(a).unwrap_err();
        assert_eq!(err, GraphError::NodeInUse("a".to_string()));

        g.disconnect(b, 0).unwrap();
        g.remove_node(a).unwrap();
        assert!(g.node_id_by_name("a").is_none());
        assert_eq!(g.node_count(), 1);

        // The freed name can be reused.
        g.add_node(unary_op("a", "Relu")).unwrap();
    }

    #[test]
    fn test_attrs() {
        let mut desc = OpDesc::new("pool", "AvgPool");
        desc.set_attr(
            "ksize",
            crate::descriptor::AttrValue::IntList(vec![1, 2, 2, 1]),
        );
        desc.set_attr("groups", crate::descriptor::AttrValue::Int(16));
        assert_eq!(desc.int_list_attr("ksize"), Some(&[1i64, 2, 2, 1][..]));
        assert_eq!(desc.int_attr("groups"), Some(16));
        // Absent or mistyped lookups are a plain None.
        assert_eq!(desc.int_attr("ksize"), None);
        assert_eq!(desc.float_attr("missing"), None);
    }
}
