use crate::config::PassConfig;
use crate::context::CompilationContext;
use crate::pass::{ActionKind, MAX_NODE_ACTION_ITERATIONS, Pass, PassError, PassRegistry, PassStage};
use onnx_fuse_graph::Graph;
use std::time::Instant;

/// Lifts a per-node action to a fixpoint.
///
/// Each sweep visits nodes in reverse topological order and stops at the first
/// node the action modifies; the graph is then resolved and the sweep restarts.
/// Returns whether any sweep modified the graph.
pub fn run_node_action(
    pass: &mut dyn Pass,
    action: usize,
    graph: &mut Graph,
    ctx: &mut CompilationContext,
) -> Result<bool, PassError> {
    let mut modified_any = false;
    for _ in 0..MAX_NODE_ACTION_ITERATIONS {
        let mut modified = false;
        for id in graph.topological_order()?.into_iter().rev() {
            if !graph.contains_node(id) {
                continue;
            }
            if pass.node_action(action, graph, ctx, id)? {
                modified = true;
                break;
            }
        }
        if !modified {
            return Ok(modified_any);
        }
        modified_any = true;
        graph.resolve()?;
    }
    Err(PassError::IterationCeiling {
        pass: pass.name().to_string(),
        action,
        iterations: MAX_NODE_ACTION_ITERATIONS,
    })
}

pub struct PassOrchestrator<'a> {
    registry: &'a PassRegistry,
}

impl<'a> PassOrchestrator<'a> {
    pub fn new(registry: &'a PassRegistry) -> Self {
        Self { registry }
    }

    /// Runs the enabled passes of `passes` in order. Returns how many ran.
    pub fn run(&self, graph: &mut Graph, ctx: &mut CompilationContext, passes: &[PassConfig]) -> Result<usize, PassError> {
        if graph.needs_resolve() {
            graph.resolve()?;
        }
        let mut executed = 0;
        for config in passes {
            if !config.enabled {
                log::debug!("Skipping disabled pass {}", config.name);
                continue;
            }
            let mut pass = self.registry.create(config.plugin_name())?;
            ctx.set_current_pass(Some(&config.name));
            let start = Instant::now();
            let result = self.run_pass(pass.as_mut(), config, graph, ctx);
            let elapsed = start.elapsed();
            ctx.set_current_pass(None);
            ctx.telemetry_mut().record_pass(&config.name, elapsed);
            log::info!("Pass {} finished in {:?}", config.name, elapsed);
            result?;
            executed += 1;
        }
        Ok(executed)
    }

    pub fn run_pass(
        &self,
        pass: &mut dyn Pass,
        config: &PassConfig,
        graph: &mut Graph,
        ctx: &mut CompilationContext,
    ) -> Result<(), PassError> {
        pass.init(&config.params, ctx)?;
        let mut stage = PassStage::Initialized;
        let result = Self::drive(pass, config, graph, ctx, &mut stage);
        pass.deinit(ctx);
        if let Err(err) = &result {
            log::debug!("Pass {} failed after stage {stage}: {err}", config.name);
        }
        result
    }

    fn drive(
        pass: &mut dyn Pass,
        config: &PassConfig,
        graph: &mut Graph,
        ctx: &mut CompilationContext,
        stage: &mut PassStage,
    ) -> Result<(), PassError> {
        pass.preprocess(graph, ctx)?;
        *stage = PassStage::Preprocessed;
        log::trace!("Pass {} reached {stage}", config.name);

        for (index, kind) in pass.actions().into_iter().enumerate() {
            let modified = match kind {
                ActionKind::Graph => pass.graph_action(index, graph, ctx)?,
                ActionKind::Node => run_node_action(pass, index, graph, ctx)?,
            };
            graph.resolve()?;
            if config.gc {
                let removed = graph.eliminate_dead_nodes()?;
                if removed > 0 {
                    ctx.telemetry_mut().add("dead_nodes_removed", removed as u64);
                    graph.resolve()?;
                }
            }
            *stage = PassStage::ActionApplied(index);
            log::trace!("Pass {} {kind} action {index} done (modified: {modified})", config.name);
        }

        pass.postprocess(graph, ctx)?;
        *stage = PassStage::Postprocessed;
        log::trace!("Pass {} reached {stage}", config.name);
        *stage = PassStage::Done;
        Ok(())
    }
}
