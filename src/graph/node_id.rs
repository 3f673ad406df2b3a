use std::num::NonZero;

/// ID of a node in a [`Graph`](super::Graph).
///
/// IDs are dense indices allocated by the graph. Zero is reserved as a niche
/// so that `Option<NodeId>` has the same size as `NodeId`.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(NonZero<u32>);

impl NodeId {
    pub(super) fn from_index(index: usize) -> NodeId {
        let id = u32::try_from(index + 1).expect("node index out of range");
        // `index + 1` cannot be zero.
        NodeId(unsafe { NonZero::new_unchecked(id) })
    }

    pub(super) fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (self.0.get() - 1).fmt(f)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.0.get() - 1)
    }
}
