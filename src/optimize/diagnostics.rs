use std::cell::RefCell;

use rustc_hash::FxHashSet;

use crate::graph::{Graph, NodeId};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Don't show any diagnostics.
    Off,
    /// Report only fusions that were skipped over invalid parameters.
    Warn,
    /// Report every fusion disposition.
    Info,
}

impl DiagnosticLevel {
    /// Read the level from the `GRAPHFUSE_VERBOSE` environment variable.
    pub fn from_env() -> DiagnosticLevel {
        match std::env::var("GRAPHFUSE_VERBOSE").as_deref() {
            Ok("1") | Ok("info") => DiagnosticLevel::Info,
            Ok("warn") => DiagnosticLevel::Warn,
            _ => DiagnosticLevel::Off,
        }
    }
}

/// Reports fusion dispositions as the runner works through the matches of a
/// sweep.
pub struct Diagnostics {
    /// Nodes whose skip has already been reported. Later sweeps matching the
    /// same node stay quiet.
    skip_reported: RefCell<FxHashSet<NodeId>>,
    level: DiagnosticLevel,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            skip_reported: RefCell::new(FxHashSet::default()),
            level: DiagnosticLevel::Off,
        }
    }

    /// Enable reporting of all messages at or above a given level.
    pub fn set_level(&mut self, level: DiagnosticLevel) {
        self.level = level;
    }

    /// Report a rewrite of the graph at `node`.
    pub fn applied(&self, graph: &Graph, pass: &str, node: NodeId, new_nodes: usize) {
        if self.level >= DiagnosticLevel::Info {
            self.log('I', graph, node, pass, format_args!("applied, {} new node(s)", new_nodes));
        }
    }

    /// Report a match that was examined and deliberately left alone.
    pub fn declined(&self, graph: &Graph, pass: &str, node: NodeId) {
        if self.level >= DiagnosticLevel::Info {
            self.log('I', graph, node, pass, format_args!("not applicable"));
        }
    }

    /// Report a match skipped over a precondition failure, once per node.
    pub fn skipped(&self, graph: &Graph, pass: &str, node: NodeId, reason: &str) {
        if self.level >= DiagnosticLevel::Warn && self.first_skip(node) {
            self.log('W', graph, node, pass, format_args!("skipped: {}", reason));
        }
    }

    /// Record a skip against `node`, returning false if one was already
    /// recorded.
    fn first_skip(&self, node: NodeId) -> bool {
        self.skip_reported.borrow_mut().insert(node)
    }

    fn log(
        &self,
        level_char: char,
        graph: &Graph,
        node: NodeId,
        pass: &str,
        message: std::fmt::Arguments<'_>,
    ) {
        println!("{}| {}: {}: {}", level_char, pass, graph.node_name(node), message);
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{DiagnosticLevel, Diagnostics};
    use crate::graph::{Graph, OpDesc};

    #[test]
    fn test_skip_reported_once_per_node() {
        let mut g = Graph::new();
        let a = g.add_node(OpDesc::new("a", "Relu")).unwrap();
        let b = g.add_node(OpDesc::new("b", "Relu")).unwrap();

        let mut diagnostics = Diagnostics::new();
        diagnostics.set_level(DiagnosticLevel::Warn);
        assert!(diagnostics.first_skip(a));
        assert!(!diagnostics.first_skip(a));
        assert!(diagnostics.first_skip(b));
    }
}
