//! Graph-rewriting compiler core for ONNX models.
//!
//! Passes rewrite an [`onnx_fuse_graph::Graph`] through structural patterns and
//! rules, fold constant subgraphs, and fuse device subgraphs. Their results live in
//! a [`CompilationContext`] that is cached under a stable key so a second compile of
//! the same model runs no passes at all.
pub mod cache;
pub mod compiler;
pub mod config;
pub mod const_fold;
pub mod context;
pub mod node_builder;
pub mod pass;
pub mod passes;
pub mod pattern;
pub mod rule;

pub use onnx_fuse_graph as graph;

pub use compiler::{CompiledProgram, Compiler, CompilerError};
pub use config::{CacheBackend, CompileConfig, PassConfig, PassParams};
pub use context::{CompilationContext, ContextError};
pub use node_builder::NodeBuilder;
pub use pass::{ActionKind, Pass, PassError, PassRegistry};
pub use pattern::{Binder, NodeInput, OpKey, Pattern, PatternBuilder, PatternId};
pub use rule::{Rule, RuleChain};
