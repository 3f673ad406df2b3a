//! graphfuse is a subgraph-rewrite engine for compute graphs, in the style
//! of a tensor compiler's fusion stage. It pattern-matches operator
//! subgraphs and rewrites them into hardware-friendly equivalents: folding
//! an average pool's divide into constant multiplies, restructuring
//! depthwise convolution weights, and synthesizing int8 bias corrections.
//!
//! ## Usage
//!
//! ```no_run
//! use graphfuse::{Graph, PassRegistry, PassRunner};
//!
//! let mut graph = Graph::new();
//! // ... build the graph ...
//! let registry = PassRegistry::with_builtin_passes();
//! let stats = PassRunner::new(&registry).run(&mut graph)?;
//! println!("applied {} fusion(s)", stats.applied);
//! # Ok::<_, graphfuse::FusionError>(())
//! ```

pub mod arith;
pub mod descriptor;
pub mod editor;
pub mod geometry;
pub mod graph;
pub mod half;
pub mod optimize;
pub mod passes;
pub mod weights;

pub use descriptor::{AttrValue, DataType, Format, TensorDesc};
pub use editor::GraphEditor;
pub use graph::{ConstData, Graph, Node, NodeId, OpDesc};
pub use optimize::{
    ApplyStats, DiagnosticLevel, FusionError, FusionPass, FusionPattern, FusionStatus, Mapping,
    PassRegistry, PassRunner,
};
