//! Pattern-guarded rewrites.
use crate::context::CompilationContext;
use crate::pass::PassError;
use crate::pattern::{Binder, Pattern};
use onnx_fuse_graph::{Graph, NodeId};

/// Rewrite callback. Receives the graph, the match bindings and the context;
/// returns `Ok(true)` only if it changed the graph. `Ok(false)` means the rule
/// declined and the next rule may try.
pub type RewriteFn = dyn Fn(&mut Graph, &Binder, &mut CompilationContext) -> Result<bool, PassError>;

pub struct Rule {
    name: String,
    pattern: Pattern,
    rewrite: Box<RewriteFn>,
}

impl Rule {
    pub fn new(
        name: &str,
        pattern: Pattern,
        rewrite: impl Fn(&mut Graph, &Binder, &mut CompilationContext) -> Result<bool, PassError> + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            pattern,
            rewrite: Box::new(rewrite),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Matches at `node` and runs the rewrite on success.
    pub fn try_apply_at(&self, graph: &mut Graph, ctx: &mut CompilationContext, node: NodeId) -> Result<bool, PassError> {
        let Some(candidate) = graph.node(node) else {
            return Ok(false);
        };
        if let Some(op) = self.pattern.root_op() {
            if !op.matches(candidate) {
                return Ok(false);
            }
        }
        let Some(binder) = self.pattern.match_node(graph, node) else {
            return Ok(false);
        };
        let applied = (self.rewrite)(graph, &binder, ctx)?;
        if applied {
            log::debug!("Rule {} rewrote node {node}", self.name);
            ctx.telemetry_mut().count("rule_rewrites");
        }
        Ok(applied)
    }

    /// One sweep of this rule alone over the graph.
    pub fn apply(&self, graph: &mut Graph, ctx: &mut CompilationContext) -> Result<bool, PassError> {
        sweep(graph, |graph, id| self.try_apply_at(graph, ctx, id))
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Ordered rules tried against every node; the first that applies wins.
#[derive(Debug, Default)]
pub struct RuleChain {
    rules: Vec<Rule>,
}

impl RuleChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply_at(&self, graph: &mut Graph, ctx: &mut CompilationContext, node: NodeId) -> Result<bool, PassError> {
        for rule in &self.rules {
            if rule.try_apply_at(graph, ctx, node)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One sweep over a topological snapshot of the graph. Nodes removed by an
    /// earlier rewrite in the same sweep are skipped.
    pub fn apply(&self, graph: &mut Graph, ctx: &mut CompilationContext) -> Result<bool, PassError> {
        sweep(graph, |graph, id| self.apply_at(graph, ctx, id))
    }
}

fn sweep(
    graph: &mut Graph,
    mut visit: impl FnMut(&mut Graph, NodeId) -> Result<bool, PassError>,
) -> Result<bool, PassError> {
    let mut modified = false;
    for id in graph.topological_order()? {
        if graph.contains_node(id) && visit(graph, id)? {
            modified = true;
        }
    }
    Ok(modified)
}
