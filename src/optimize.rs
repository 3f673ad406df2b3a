//! Driver for the fusion passes: the pass trait, the registry of built-in
//! passes and the runner that sweeps a registry over a graph.

use std::error::Error;
use std::fmt;

use crate::arith::Overflow;
use crate::editor::EditError;
use crate::graph::{Graph, GraphError, NodeId};
use crate::weights::WeightError;

mod diagnostics;
mod pattern_matcher;

pub use diagnostics::{DiagnosticLevel, Diagnostics};
pub use pattern_matcher::{find_matches, FusionPattern, Mapping};

/// Outcome of applying a fusion to one match.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FusionStatus {
    /// The graph was rewritten.
    Changed,
    /// The match was examined and deliberately left alone.
    NotChanged,
}

/// Errors from a fusion application.
///
/// The distinction matters because there is no rollback: a `ParamInvalid` is
/// raised before any mutation and the runner simply moves to the next match,
/// while a `Failed` may leave a partially rewritten graph and aborts the run.
#[derive(Clone, Debug, PartialEq)]
pub enum FusionError {
    /// A precondition on the matched nodes does not hold. Raised before the
    /// first mutation; the graph is untouched.
    ParamInvalid(String),
    /// A mutation step failed after earlier steps already applied.
    Failed(String),
}

impl fmt::Display for FusionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusionError::ParamInvalid(reason) => write!(f, "invalid parameter: {}", reason),
            FusionError::Failed(reason) => write!(f, "fusion failed: {}", reason),
        }
    }
}

impl Error for FusionError {}

impl From<Overflow> for FusionError {
    fn from(_: Overflow) -> FusionError {
        FusionError::ParamInvalid("element count exceeds i64 range".to_string())
    }
}

impl From<WeightError> for FusionError {
    fn from(err: WeightError) -> FusionError {
        FusionError::ParamInvalid(err.to_string())
    }
}

impl From<GraphError> for FusionError {
    fn from(err: GraphError) -> FusionError {
        FusionError::Failed(err.to_string())
    }
}

impl From<EditError> for FusionError {
    fn from(err: EditError) -> FusionError {
        FusionError::Failed(err.to_string())
    }
}

/// A single graph-rewriting fusion.
///
/// A fresh pass instance is created for every sweep, so per-sweep state such
/// as constant caches lives in the implementing struct's fields.
pub trait FusionPass {
    /// Human-readable pass name used in diagnostics.
    fn name(&self) -> &str;

    /// Subgraph shapes this pass wants to examine.
    fn patterns(&self) -> Vec<FusionPattern>;

    /// Try to rewrite the graph at one match. Nodes created by the rewrite
    /// are appended to `new_nodes` so the runner can report them.
    fn fuse(
        &mut self,
        graph: &mut Graph,
        mapping: &Mapping,
        new_nodes: &mut Vec<NodeId>,
    ) -> Result<FusionStatus, FusionError>;
}

type PassFactory = Box<dyn Fn() -> Box<dyn FusionPass>>;

struct PassEntry {
    name: String,
    factory: PassFactory,
}

/// Ordered collection of fusion passes, applied in registration order.
pub struct PassRegistry {
    entries: Vec<PassEntry>,
}

impl PassRegistry {
    pub fn new() -> PassRegistry {
        PassRegistry {
            entries: Vec::new(),
        }
    }

    /// Registry pre-populated with all built-in passes.
    pub fn with_builtin_passes() -> PassRegistry {
        let mut reg = PassRegistry::new();
        reg.register("AvgPoolFusion", || {
            Box::new(crate::passes::AvgPoolFusion::new())
        });
        reg.register("PoolingFusion", || {
            Box::new(crate::passes::PoolingFusion::new())
        });
        reg.register("Conv2DbpFilterMulFusion", || {
            Box::new(crate::passes::Conv2DbpFilterMulFusion::new())
        });
        reg.register("DepthwiseDwMulFusion", || {
            Box::new(crate::passes::DepthwiseDwMulFusion::new())
        });
        reg.register("DepthwiseDfFusion", || {
            Box::new(crate::passes::DepthwiseDfFusion::new())
        });
        reg.register("DepthwiseChannelSwap", || {
            Box::new(crate::passes::DepthwiseChannelSwap::new())
        });
        reg
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn FusionPass> + 'static,
    {
        self.entries.push(PassEntry {
            name: name.to_string(),
            factory: Box::new(factory),
        });
    }

    pub fn pass_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

impl Default for PassRegistry {
    fn default() -> Self {
        PassRegistry::with_builtin_passes()
    }
}

/// Counts of fusion decisions over one run.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ApplyStats {
    /// Matches that rewrote the graph.
    pub applied: usize,
    /// Matches examined and left alone.
    pub declined: usize,
    /// Matches skipped because a precondition did not hold.
    pub skipped: usize,
}

/// Applies every pass in a registry to a graph, one sweep each.
pub struct PassRunner<'a> {
    registry: &'a PassRegistry,
    diagnostics: Diagnostics,
}

impl<'a> PassRunner<'a> {
    pub fn new(registry: &'a PassRegistry) -> PassRunner<'a> {
        let mut diagnostics = Diagnostics::new();
        diagnostics.set_level(DiagnosticLevel::from_env());
        PassRunner {
            registry,
            diagnostics,
        }
    }

    pub fn set_diagnostic_level(&mut self, level: DiagnosticLevel) {
        self.diagnostics.set_level(level);
    }

    /// Run every registered pass over the graph.
    ///
    /// Matches for each pattern are collected up front and then applied, so
    /// one rewrite never invalidates the traversal. A match whose nodes were
    /// removed by an earlier rewrite in the same sweep is dropped silently.
    /// Precondition failures skip only the offending match; a mutation
    /// failure aborts the whole run since the graph may be half-rewritten.
    pub fn run(&self, graph: &mut Graph) -> Result<ApplyStats, FusionError> {
        let mut stats = ApplyStats::default();
        for entry in &self.registry.entries {
            let mut pass = (entry.factory)();
            for pattern in pass.patterns() {
                let matches = find_matches(graph, &pattern);
                for mapping in matches {
                    if mapping.node_ids().any(|id| graph.get(id).is_none()) {
                        continue;
                    }
                    let anchor = mapping.node_ids().next();
                    let mut new_nodes = Vec::new();
                    match pass.fuse(graph, &mapping, &mut new_nodes) {
                        Ok(FusionStatus::Changed) => {
                            stats.applied += 1;
                            if let Some(node) = anchor {
                                self.diagnostics.applied(
                                    graph,
                                    &entry.name,
                                    node,
                                    new_nodes.len(),
                                );
                            }
                        }
                        Ok(FusionStatus::NotChanged) => {
                            stats.declined += 1;
                            if let Some(node) = anchor {
                                self.diagnostics.declined(graph, &entry.name, node);
                            }
                        }
                        Err(FusionError::ParamInvalid(reason)) => {
                            stats.skipped += 1;
                            if let Some(node) = anchor {
                                self.diagnostics.skipped(graph, &entry.name, node, &reason);
                            }
                        }
                        Err(err @ FusionError::Failed(_)) => return Err(err),
                    }
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ApplyStats, FusionError, FusionPass, FusionPattern, FusionStatus, Mapping, PassRegistry,
        PassRunner,
    };
    use crate::descriptor::{AttrValue, DataType, Format, TensorDesc};
    use crate::graph::{Graph, NodeId, OpDesc};

    fn unary_op(name: &str, op_type: &str) -> OpDesc {
        let desc = TensorDesc::new(&[1, 16, 4, 4], Format::Nchw, DataType::Float16);
        OpDesc::new(name, op_type)
            .with_input(desc.clone())
            .with_output(desc)
    }

    /// Pass that tags every Relu with a marker attribute.
    struct TagRelu;

    impl FusionPass for TagRelu {
        fn name(&self) -> &str {
            "TagRelu"
        }

        fn patterns(&self) -> Vec<FusionPattern> {
            vec![FusionPattern::new("relu").with_op("relu", &["Relu"])]
        }

        fn fuse(
            &mut self,
            graph: &mut Graph,
            mapping: &Mapping,
            _new_nodes: &mut Vec<NodeId>,
        ) -> Result<FusionStatus, FusionError> {
            let id = mapping.node("relu").ok_or_else(|| {
                FusionError::ParamInvalid("relu anchor missing".to_string())
            })?;
            let node = graph
                .get_mut(id)
                .ok_or_else(|| FusionError::ParamInvalid("node removed".to_string()))?;
            if node.desc().bool_attr("tagged") == Some(true) {
                return Ok(FusionStatus::NotChanged);
            }
            node.desc_mut().set_attr("tagged", AttrValue::Bool(true));
            Ok(FusionStatus::Changed)
        }
    }

    #[test]
    fn test_runner_collects_then_applies() {
        let mut g = Graph::new();
        g.add_node(unary_op("r1", "Relu")).unwrap();
        g.add_node(unary_op("r2", "Relu")).unwrap();
        g.add_node(unary_op("p", "AvgPool")).unwrap();

        let mut reg = PassRegistry::new();
        reg.register("TagRelu", || Box::new(TagRelu));
        let runner = PassRunner::new(&reg);

        let stats = runner.run(&mut g).unwrap();
        assert_eq!(
            stats,
            ApplyStats {
                applied: 2,
                declined: 0,
                skipped: 0
            }
        );

        // Second run declines every match: the rewrite is idempotent.
        let stats = runner.run(&mut g).unwrap();
        assert_eq!(
            stats,
            ApplyStats {
                applied: 0,
                declined: 2,
                skipped: 0
            }
        );
    }

    /// Pass that always reports a precondition failure.
    struct AlwaysSkip;

    impl FusionPass for AlwaysSkip {
        fn name(&self) -> &str {
            "AlwaysSkip"
        }

        fn patterns(&self) -> Vec<FusionPattern> {
            vec![FusionPattern::new("relu").with_op("relu", &["Relu"])]
        }

        fn fuse(
            &mut self,
            _graph: &mut Graph,
            _mapping: &Mapping,
            _new_nodes: &mut Vec<NodeId>,
        ) -> Result<FusionStatus, FusionError> {
            Err(FusionError::ParamInvalid("unsupported".to_string()))
        }
    }

    #[test]
    fn test_param_invalid_skips_match_only() {
        let mut g = Graph::new();
        g.add_node(unary_op("r1", "Relu")).unwrap();
        g.add_node(unary_op("r2", "Relu")).unwrap();

        let mut reg = PassRegistry::new();
        reg.register("AlwaysSkip", || Box::new(AlwaysSkip));
        let stats = PassRunner::new(&reg).run(&mut g).unwrap();
        assert_eq!(stats.skipped, 2);
    }

    /// Pass that fails mid-mutation.
    struct AlwaysFail;

    impl FusionPass for AlwaysFail {
        fn name(&self) -> &str {
            "AlwaysFail"
        }

        fn patterns(&self) -> Vec<FusionPattern> {
            vec![FusionPattern::new("relu").with_op("relu", &["Relu"])]
        }

        fn fuse(
            &mut self,
            _graph: &mut Graph,
            _mapping: &Mapping,
            _new_nodes: &mut Vec<NodeId>,
        ) -> Result<FusionStatus, FusionError> {
            Err(FusionError::Failed("wiring failed".to_string()))
        }
    }

    #[test]
    fn test_failed_aborts_run() {
        let mut g = Graph::new();
        g.add_node(unary_op("r1", "Relu")).unwrap();
        g.add_node(unary_op("r2", "Relu")).unwrap();

        let mut reg = PassRegistry::new();
        reg.register("AlwaysFail", || Box::new(AlwaysFail));
        let err = PassRunner::new(&reg).run(&mut g).unwrap_err();
        assert!(matches!(err, FusionError::Failed(_)));
    }

    #[test]
    fn test_builtin_registry_order() {
        let reg = PassRegistry::with_builtin_passes();
        let names: Vec<_> = reg.pass_names().collect();
        assert_eq!(
            names,
            [
                "AvgPoolFusion",
                "PoolingFusion",
                "Conv2DbpFilterMulFusion",
                "DepthwiseDwMulFusion",
                "DepthwiseDfFusion",
                "DepthwiseChannelSwap",
            ]
        );
    }
}
