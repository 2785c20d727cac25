//! Pass lifecycle and orchestration.
mod orchestrator;
mod registry;

pub use orchestrator::{PassOrchestrator, run_node_action};
pub use registry::{PassFactory, PassRegistry};

use crate::config::PassParams;
use crate::context::{CompilationContext, ContextError};
use crate::const_fold::FoldError;
use onnx_fuse_graph::{Graph, GraphError, NodeId};

/// Upper bound on fixpoint sweeps of a single node action.
pub const MAX_NODE_ACTION_ITERATIONS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error(transparent)]
    GraphError(#[from] GraphError),
    #[error(transparent)]
    ContextError(#[from] ContextError),
    #[error(transparent)]
    FoldError(#[from] FoldError),
    #[error("No pass registered as \"{0}\"")]
    UnknownPass(String),
    #[error("Pass \"{pass}\" action {action} still modified the graph after {iterations} sweeps")]
    IterationCeiling {
        pass: String,
        action: usize,
        iterations: usize,
    },
    #[error("Pass \"{pass}\" does not implement {kind} action {action}")]
    UnimplementedAction {
        pass: String,
        kind: ActionKind,
        action: usize,
    },
    #[error("Pass \"{pass}\" parameter \"{param}\": {reason}")]
    InvalidParameter {
        pass: String,
        param: String,
        reason: String,
    },
    #[error("Pass \"{pass}\" failed: {source:#}")]
    Custom {
        pass: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ActionKind {
    #[strum(serialize = "graph")]
    Graph,
    #[strum(serialize = "node")]
    Node,
}

/// How far a pass got. Recorded by the orchestrator for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum PassStage {
    Constructed,
    Initialized,
    Preprocessed,
    ActionApplied(usize),
    Postprocessed,
    Done,
}

/// A graph transformation with a fixed lifecycle:
/// `init`, `preprocess`, each action in order, `postprocess`, then `deinit`.
///
/// A graph action runs once over the whole graph. A node action is called per node
/// and lifted to a fixpoint by the orchestrator.
/// Both return whether they modified the graph.
pub trait Pass {
    fn name(&self) -> &str;

    fn actions(&self) -> Vec<ActionKind>;

    fn init(&mut self, _params: &PassParams, _ctx: &mut CompilationContext) -> Result<(), PassError> {
        Ok(())
    }

    fn preprocess(&mut self, _graph: &mut Graph, _ctx: &mut CompilationContext) -> Result<(), PassError> {
        Ok(())
    }

    fn graph_action(&mut self, action: usize, _graph: &mut Graph, _ctx: &mut CompilationContext) -> Result<bool, PassError> {
        Err(PassError::UnimplementedAction {
            pass: self.name().to_string(),
            kind: ActionKind::Graph,
            action,
        })
    }

    fn node_action(
        &mut self,
        action: usize,
        _graph: &mut Graph,
        _ctx: &mut CompilationContext,
        _node: NodeId,
    ) -> Result<bool, PassError> {
        Err(PassError::UnimplementedAction {
            pass: self.name().to_string(),
            kind: ActionKind::Node,
            action,
        })
    }

    fn postprocess(&mut self, _graph: &mut Graph, _ctx: &mut CompilationContext) -> Result<(), PassError> {
        Ok(())
    }

    /// Runs after every successful `init`, whether or not the later stages succeed.
    fn deinit(&mut self, _ctx: &mut CompilationContext) {}
}
