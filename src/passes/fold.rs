use crate::config::PassParams;
use crate::const_fold::FoldInterpreter;
use crate::context::CompilationContext;
use crate::pass::{ActionKind, Pass, PassError};
use onnx_fuse_graph::Graph;

/// Folds every node whose inputs are all literal into a constant.
///
/// `params.ops` restricts the evaluator catalogue to the listed operators.
#[derive(Default)]
pub struct ConstFold {
    interpreter: FoldInterpreter,
}

impl Pass for ConstFold {
    fn name(&self) -> &str {
        "const_fold"
    }

    fn actions(&self) -> Vec<ActionKind> {
        vec![ActionKind::Graph]
    }

    fn init(&mut self, params: &PassParams, _ctx: &mut CompilationContext) -> Result<(), PassError> {
        if let Some(ops) = params.get_strings("ops") {
            self.interpreter.retain(&ops);
        }
        Ok(())
    }

    fn graph_action(&mut self, _action: usize, graph: &mut Graph, ctx: &mut CompilationContext) -> Result<bool, PassError> {
        let folded = self.interpreter.fold_graph(graph, ctx)?;
        if folded > 0 {
            log::info!("Folded {folded} nodes");
        }
        Ok(folded > 0)
    }
}
