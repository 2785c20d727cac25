use crate::config::PassParams;
use crate::const_fold::FIX_NEURON_DOMAIN;
use crate::context::CompilationContext;
use crate::pass::{ActionKind, Pass, PassError};
use onnx_fuse_graph::{Graph, NodeId};

/// Records the fixed-point position of every `FixNeuron` on both of its edges and
/// copies it onto fused subgraph boundaries.
///
/// With `params.strip` set, a second action bypasses every `FixNeuron` that does
/// not produce a graph output, all in one go.
#[derive(Default)]
pub struct PropagateFixInfo {
    strip: bool,
    recorded: usize,
}

impl PropagateFixInfo {
    fn record(&mut self, ctx: &mut CompilationContext, edge: &str, fix_point: i64) -> Result<(), PassError> {
        match ctx.get_fix_info(edge) {
            Ok(existing) if existing != fix_point => Err(PassError::Custom {
                pass: self.name().to_string(),
                source: anyhow::anyhow!("edge {edge} has fix point {existing} and {fix_point}"),
            }),
            Ok(_) => Ok(()),
            Err(_) => {
                ctx.set_fix_info(edge, fix_point);
                self.recorded += 1;
                Ok(())
            }
        }
    }
}

impl Pass for PropagateFixInfo {
    fn name(&self) -> &str {
        "propagate_fix_info"
    }

    fn actions(&self) -> Vec<ActionKind> {
        vec![ActionKind::Node, ActionKind::Graph]
    }

    fn init(&mut self, params: &PassParams, _ctx: &mut CompilationContext) -> Result<(), PassError> {
        self.strip = params.get_bool("strip").unwrap_or(false);
        Ok(())
    }

    fn node_action(
        &mut self,
        _action: usize,
        graph: &mut Graph,
        ctx: &mut CompilationContext,
        id: NodeId,
    ) -> Result<bool, PassError> {
        let Some(node) = graph.node(id) else {
            return Ok(false);
        };
        if !node.is_op(FIX_NEURON_DOMAIN, "FixNeuron") {
            return Ok(false);
        }
        let fix_point = node.attribute_int("fix_point").ok_or_else(|| PassError::Custom {
            pass: self.name().to_string(),
            source: anyhow::anyhow!("FixNeuron {} has no fix_point", node.name),
        })?;
        let (Some(input), Some(output)) = (node.input(0).map(str::to_string), node.output(0).map(str::to_string)) else {
            return Ok(false);
        };
        self.record(ctx, &input, fix_point)?;
        self.record(ctx, &output, fix_point)?;
        Ok(false)
    }

    fn graph_action(&mut self, _action: usize, graph: &mut Graph, _ctx: &mut CompilationContext) -> Result<bool, PassError> {
        if !self.strip {
            return Ok(false);
        }
        let markers: Vec<NodeId> = graph
            .nodes()
            .filter(|(_, node)| node.is_op(FIX_NEURON_DOMAIN, "FixNeuron"))
            .map(|(id, _)| id)
            .collect();
        let mut stripped = 0;
        for id in markers {
            // Inputs are read now since bypassing an upstream marker rewires them.
            let Some(node) = graph.node(id) else {
                continue;
            };
            let (Some(input), Some(output)) = (node.input(0).map(str::to_string), node.output(0).map(str::to_string)) else {
                continue;
            };
            if graph.is_graph_output(&output) {
                continue;
            }
            graph.rewire_consumers(&output, &input);
            graph.remove_node(id)?;
            stripped += 1;
        }
        log::debug!("Stripped {stripped} FixNeuron nodes");
        Ok(stripped > 0)
    }

    fn postprocess(&mut self, _graph: &mut Graph, ctx: &mut CompilationContext) -> Result<(), PassError> {
        let mut params = vec![];
        for (index, meta_def) in ctx.meta_defs().iter().enumerate() {
            for edge in meta_def.inputs.iter().chain(&meta_def.outputs) {
                if let Ok(fix_point) = ctx.get_fix_info(edge) {
                    params.push((index, format!("fix_point.{edge}"), fix_point.to_string()));
                }
            }
        }
        let meta_defs = ctx.meta_defs_mut();
        for (index, key, value) in params {
            meta_defs[index].generic_params.insert(key, value);
        }
        log::debug!("Recorded fix info for {} edges", self.recorded);
        Ok(())
    }
}
