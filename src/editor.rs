//! Higher-level graph surgery built on top of [`Graph`]: inserting
//! elementwise ops behind a producer, attaching constant inputs and marking
//! nodes as already rewritten.

use std::error::Error;
use std::fmt;

use crate::descriptor::{AttrValue, TensorDesc, UnsupportedLayout};
use crate::graph::{ConstData, Graph, GraphError, NodeId, OpDesc, OutputRef};

/// Attribute set on a node once a structural rewrite has been applied to it,
/// so repeated sweeps and recursive walks skip it.
pub const TRANSFORMED_ATTR: &str = "_has_been_changed";

/// Errors from editing operations.
#[derive(Clone, Debug, PartialEq)]
pub enum EditError {
    Graph(GraphError),
    /// The producer output has no consumers to splice an op in front of.
    NoConsumers(String),
    /// The producer output descriptor has no dimensions to derive the
    /// inserted op's shape from.
    MissingShape(String),
    /// The producer output's origin format cannot be retiled to NC1HWC0.
    Layout(UnsupportedLayout),
}

impl fmt::Display for EditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditError::Graph(err) => err.fmt(f),
            EditError::NoConsumers(name) => {
                write!(f, "output of \"{}\" has no consumers", name)
            }
            EditError::MissingShape(name) => {
                write!(f, "output of \"{}\" has no shape", name)
            }
            EditError::Layout(err) => err.fmt(f),
        }
    }
}

impl Error for EditError {}

impl From<GraphError> for EditError {
    fn from(err: GraphError) -> EditError {
        EditError::Graph(err)
    }
}

impl From<UnsupportedLayout> for EditError {
    fn from(err: UnsupportedLayout) -> EditError {
        EditError::Layout(err)
    }
}

/// Mutable view over a graph offering the splice-style edits the fusion
/// passes need. Edits apply immediately; there is no rollback, so callers
/// order their fallible checks before the first mutation.
pub struct GraphEditor<'a> {
    graph: &'a mut Graph,
}

impl<'a> GraphEditor<'a> {
    pub fn new(graph: &'a mut Graph) -> GraphEditor<'a> {
        GraphEditor { graph }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        self.graph
    }

    /// Pick a node name that is free in the graph, appending a counter to
    /// `base` if it is already taken.
    pub fn unique_name(&self, base: &str) -> String {
        if self.graph.node_id_by_name(base).is_none() {
            return base.to_string();
        }
        let mut i = 1;
        loop {
            let candidate = format!("{}_{}", base, i);
            if self.graph.node_id_by_name(&candidate).is_none() {
                return candidate;
            }
            i += 1;
        }
    }

    /// Move every consumer of `from` onto `to`. Each edge is removed before
    /// it is re-added, so a single producer per input slot holds throughout.
    /// Returns the number of edges moved.
    pub fn redirect_consumers(
        &mut self,
        from: OutputRef,
        to: OutputRef,
    ) -> Result<usize, EditError> {
        let consumers = self.graph.consumers(from.node, from.port);
        for &(consumer, in_port) in &consumers {
            self.graph.disconnect(consumer, in_port)?;
            self.graph.connect(to.node, to.port, consumer, in_port)?;
        }
        Ok(consumers.len())
    }

    /// Copy of `producer`'s output descriptor at `port`, validated for
    /// splicing: it must have dimensions and at least one consumer.
    fn splice_desc(&self, producer: NodeId, port: usize) -> Result<TensorDesc, EditError> {
        let src_node = self
            .graph
            .get(producer)
            .ok_or(EditError::Graph(GraphError::InvalidNode(producer)))?;
        let desc = src_node
            .desc()
            .output_descs
            .get(port)
            .ok_or(EditError::Graph(GraphError::InvalidPort {
                node: producer,
                port,
            }))?
            .clone();
        if desc.shape.is_empty() {
            return Err(EditError::MissingShape(src_node.name().to_string()));
        }
        if self.graph.consumers(producer, port).is_empty() {
            return Err(EditError::NoConsumers(src_node.name().to_string()));
        }
        Ok(desc)
    }

    /// Add a single-input node carrying `desc` on both ports and splice it
    /// between `producer`'s output `port` and all of its consumers.
    fn splice_after(
        &mut self,
        producer: NodeId,
        port: usize,
        name: &str,
        op_type: &str,
        desc: TensorDesc,
    ) -> Result<NodeId, EditError> {
        let name = self.unique_name(name);
        let op = OpDesc::new(&name, op_type)
            .with_input(desc.clone())
            .with_output(desc);
        let inserted = self.graph.add_node(op)?;
        self.redirect_consumers(
            OutputRef {
                node: producer,
                port,
            },
            OutputRef {
                node: inserted,
                port: 0,
            },
        )?;
        self.graph.connect(producer, port, inserted, 0)?;
        Ok(inserted)
    }

    /// Splice a new single-input node between `producer`'s output `port` and
    /// all of its consumers. The new node's input and output descriptors both
    /// start as copies of the producer's output descriptor.
    pub fn insert_after(
        &mut self,
        producer: NodeId,
        port: usize,
        name: &str,
        op_type: &str,
    ) -> Result<NodeId, EditError> {
        let desc = self.splice_desc(producer, port)?;
        self.splice_after(producer, port, name, op_type, desc)
    }

    /// Splice an elementwise `Mul` behind `producer`'s output `port`. The
    /// second operand slot is left open for [`Self::attach_const_input`].
    ///
    /// With `retile` set the copied descriptor is reformatted into the 5-D
    /// NC1HWC0 layout, failing before any mutation if the origin format has
    /// no named channel axis.
    pub fn insert_elementwise_mul(
        &mut self,
        producer: NodeId,
        port: usize,
        retile: bool,
    ) -> Result<NodeId, EditError> {
        let mut desc = self.splice_desc(producer, port)?;
        if retile {
            desc.retile_nc1hwc0()?;
        }
        let base = format!("{}_mul", self.graph.node_name(producer));
        self.splice_after(producer, port, &base, "Mul", desc)
    }

    /// Create a `Const` node carrying `data` and wire it into input `port`
    /// of `node`, growing the node's input list if the port is one past the
    /// end. Returns the new constant's ID.
    pub fn attach_const_input(
        &mut self,
        node: NodeId,
        port: usize,
        name: &str,
        desc: TensorDesc,
        data: ConstData,
    ) -> Result<NodeId, EditError> {
        let name = self.unique_name(name);
        let const_op = OpDesc::new(&name, "Const")
            .with_output(desc.clone())
            .with_weight(data);
        let const_id = self.graph.add_node(const_op)?;
        self.attach_existing_input(node, port, OutputRef { node: const_id, port: 0 })?;
        Ok(const_id)
    }

    /// Wire an existing producer output into input `port` of `node`,
    /// growing the node's input list if the port is one past the end.
    pub fn attach_existing_input(
        &mut self,
        node: NodeId,
        port: usize,
        src: OutputRef,
    ) -> Result<(), EditError> {
        let n_inputs = self
            .graph
            .get(node)
            .ok_or(EditError::Graph(GraphError::InvalidNode(node)))?
            .inputs()
            .len();
        if port == n_inputs {
            let desc = self
                .graph
                .get(src.node)
                .ok_or(EditError::Graph(GraphError::InvalidNode(src.node)))?
                .desc()
                .output_descs
                .get(src.port)
                .ok_or(EditError::Graph(GraphError::InvalidPort {
                    node: src.node,
                    port: src.port,
                }))?
                .clone();
            self.graph.append_input_slot(node, desc)?;
        }
        self.graph.connect(src.node, src.port, node, port)?;
        Ok(())
    }

    /// Mark a node as structurally rewritten.
    pub fn mark_transformed(&mut self, node: NodeId) -> Result<(), EditError> {
        let node = self
            .graph
            .get_mut(node)
            .ok_or(EditError::Graph(GraphError::InvalidNode(node)))?;
        node.desc_mut().set_attr(TRANSFORMED_ATTR, AttrValue::Bool(true));
        Ok(())
    }

    pub fn is_transformed(&self, node: NodeId) -> bool {
        self.graph
            .get(node)
            .map(|n| n.desc().bool_attr(TRANSFORMED_ATTR) == Some(true))
            .unwrap_or(false)
    }
}
