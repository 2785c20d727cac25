use crate::config::PassParams;
use crate::const_fold::literal_value;
use crate::context::CompilationContext;
use crate::context::meta_def::MetaDef;
use crate::pass::{ActionKind, Pass, PassError};
use crate::pattern::PatternBuilder;
use crate::rule::{Rule, RuleChain};
use onnx_fuse_graph::{DType, Graph};

pub const MATMUL_ADD_OP: &str = "MatMulAdd";

/// Fuses `MatMul(x, W) + b` with literal `W: [K, N]` and `b: [N]` into one
/// device subgraph.
///
/// Weights are stored transposed (`[N, K]`) in one lazily filled region per weight
/// edge; every fusion refers to it through its own alias.
#[derive(Default)]
pub struct FuseMatMulAdd {
    rules: RuleChain,
}

fn fuse_rule() -> Rule {
    let mut b = PatternBuilder::new();
    let x = b.wildcard();
    let w = b.constant();
    let matmul = b.node("MatMul", &[x, w]);
    let bias = b.constant();
    let add = b.node("Add", &[matmul, bias]);
    let pattern = b.build(add);

    Rule::new("fuse_matmul_add", pattern, move |graph, binder, ctx| {
        let (Some(matmul_id), Some(add_id)) = (binder.node(matmul), binder.node(add)) else {
            return Ok(false);
        };
        let (Some(x_edge), Some(w_edge), Some(b_edge), Some(mm_out)) =
            (binder.edge(x), binder.edge(w), binder.edge(bias), binder.edge(matmul))
        else {
            return Ok(false);
        };
        if graph.is_graph_output(mm_out) || graph.consumers(mm_out).len() != 1 {
            return Ok(false);
        }
        let (Some(weights), Some(bias_value)) = (literal_value(graph, ctx, w_edge)?, literal_value(graph, ctx, b_edge)?)
        else {
            return Ok(false);
        };
        let &[k, n] = weights.shape() else {
            return Ok(false);
        };
        if weights.dtype() != DType::F32 || bias_value.dtype() != DType::F32 || bias_value.numel() != n {
            log::debug!("Not fusing MatMul on {w_edge}: unsupported weight or bias layout");
            return Ok(false);
        }

        let (Some(matmul_node), Some(add_node)) = (graph.node(matmul_id), graph.node(add_id)) else {
            return Ok(false);
        };
        let Some(out) = add_node.output(0).map(str::to_string) else {
            return Ok(false);
        };
        let members = [matmul_node.name.clone(), add_node.name.clone()];

        let weights_region = format!("{w_edge}/nk");
        if !ctx.has_const(&weights_region) {
            let data = weights.into_data();
            ctx.create_lazy_const(&weights_region, k * n * 4, &[n, k], DType::F32, move |bytes| {
                for row in 0..k {
                    for col in 0..n {
                        let src = (row * n + col) * 4;
                        let dst = (col * k + row) * 4;
                        bytes[dst..dst + 4].copy_from_slice(&data[src..src + 4]);
                    }
                }
                Ok(())
            })?;
        }
        let weights_alias = format!("{out}/weights");
        let bias_region = format!("{out}/bias");
        ctx.create_const_alias(&weights_alias, &weights_region)?;
        ctx.create_const(&bias_region, bias_value.data(), &[n], DType::F32)?;

        let meta_def = MetaDef::new(MATMUL_ADD_OP)
            .with_inputs([x_edge, w_edge, b_edge])
            .with_outputs([out.as_str()])
            .with_nodes(&members)
            .with_param("weights", weights_alias)
            .with_param("bias", bias_region)
            .with_param("weights_layout", "NK")
            .with_param("in_features", k.to_string())
            .with_param("out_features", n.to_string());
        ctx.append_fused_subgraph(graph, meta_def)?;
        Ok(true)
    })
}

impl Pass for FuseMatMulAdd {
    fn name(&self) -> &str {
        "fuse_matmul_add"
    }

    fn actions(&self) -> Vec<ActionKind> {
        vec![ActionKind::Graph]
    }

    fn init(&mut self, _params: &PassParams, _ctx: &mut CompilationContext) -> Result<(), PassError> {
        self.rules.push(fuse_rule());
        Ok(())
    }

    fn graph_action(&mut self, _action: usize, graph: &mut Graph, ctx: &mut CompilationContext) -> Result<bool, PassError> {
        self.rules.apply(graph, ctx)
    }
}
