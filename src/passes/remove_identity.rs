use crate::config::PassParams;
use crate::context::CompilationContext;
use crate::pass::{ActionKind, Pass, PassError};
use crate::pattern::PatternBuilder;
use crate::rule::{Rule, RuleChain};
use onnx_fuse_graph::Graph;

/// Bypasses `Identity` nodes and inference-mode `Dropout`.
#[derive(Default)]
pub struct RemoveIdentity {
    rules: RuleChain,
}

fn bypass_rule(name: &str, op: &str, optional_inputs: usize) -> Rule {
    let mut b = PatternBuilder::new();
    let data = b.wildcard();
    let mut children = vec![data];
    let mut optional = vec![false];
    for _ in 0..optional_inputs {
        children.push(b.wildcard());
        optional.push(true);
    }
    let root = b.node_with_optional(op, &children, &optional);
    let pattern = b.build(root);
    let training = children.get(2).copied();
    Rule::new(name, pattern, move |graph, binder, _ctx| {
        let (Some(id), Some(input)) = (binder.node(root), binder.edge(data)) else {
            return Ok(false);
        };
        // Dropout only folds away when it cannot be in training mode.
        if let Some(training) = training.and_then(|x| binder.edge(x)) {
            let enabled = graph
                .literal(training)
                .and_then(|x| x.to_vec::<bool>().ok())
                .is_none_or(|x| x.iter().any(|v| *v));
            if enabled {
                return Ok(false);
            }
        }
        let Some(node) = graph.node(id) else {
            return Ok(false);
        };
        let Some(output) = node.outputs.first().cloned() else {
            return Ok(false);
        };
        let extra_outputs_used = node
            .outputs
            .iter()
            .skip(1)
            .any(|x| graph.is_graph_output(x) || !graph.consumers(x).is_empty());
        if graph.is_graph_output(&output) || extra_outputs_used {
            return Ok(false);
        }
        let input = input.to_string();
        graph.rewire_consumers(&output, &input);
        graph.remove_node(id)?;
        Ok(true)
    })
}

impl Pass for RemoveIdentity {
    fn name(&self) -> &str {
        "remove_identity"
    }

    fn actions(&self) -> Vec<ActionKind> {
        vec![ActionKind::Graph]
    }

    fn init(&mut self, params: &PassParams, _ctx: &mut CompilationContext) -> Result<(), PassError> {
        let ops = params
            .get_strings("ops")
            .unwrap_or_else(|| vec!["Identity".to_string(), "Dropout".to_string()]);
        for op in ops {
            let rule = match op.as_str() {
                "Identity" => bypass_rule("bypass_identity", "Identity", 0),
                "Dropout" => bypass_rule("bypass_dropout", "Dropout", 2),
                other => {
                    return Err(PassError::InvalidParameter {
                        pass: self.name().to_string(),
                        param: "ops".to_string(),
                        reason: format!("cannot remove {other}"),
                    });
                }
            };
            self.rules.push(rule);
        }
        Ok(())
    }

    fn graph_action(&mut self, _action: usize, graph: &mut Graph, ctx: &mut CompilationContext) -> Result<bool, PassError> {
        self.rules.apply(graph, ctx)
    }
}
