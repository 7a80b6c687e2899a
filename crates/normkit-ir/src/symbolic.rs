// Batch-norm symbolic export: one `BatchNormalization` node per call
//
// Node layout:
//
//   inputs   [x, scale, bias, running_mean, running_var]
//   outputs  inference: [y]
//            training:  [y, running_mean', running_var', dead, dead]
//
// running_mean'/running_var' are typed like inputs 3 and 4. The two dead
// outputs carry nothing and are renamed
// `batch_norm_dead_output-<name>`.
//
// The executor and the exporter branch on the same `Phase`, so the node's
// output arity always matches what the forward executor does with the same
// training flag.

use normkit_core::{bail, Phase, Result, TensorId};
use tracing::debug;

use crate::graph::{SourceLocation, ValueId};
use crate::trace::TraceContext;

pub const BATCH_NORMALIZATION: &str = "BatchNormalization";
pub const DEAD_OUTPUT_PREFIX: &str = "batch_norm_dead_output-";

/// Inputs 3 and 4 (running statistics) are updated in place.
pub const CONSUMED_INPUTS: [i64; 5] = [0, 0, 0, 1, 1];

/// Runtime parameters of the batch norm being exported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormSymbolic {
    pub training: bool,
    pub eps: f64,
    /// Weight of the batch statistic in the running average. The node stores
    /// `1 - momentum`, the weight of the old value.
    pub momentum: f64,
    pub running_mean: TensorId,
    pub running_var: TensorId,
}

impl BatchNormSymbolic {
    pub fn phase(&self) -> Phase {
        Phase::from_training(self.training)
    }
}

/// Append a `BatchNormalization` node for `inputs = [x, scale, bias]` and
/// return its primary output. The running statistics always come from the
/// buffer traces, so any other input count is an error.
///
/// The updated running statistics of a training node are reachable through
/// the node, not through the return value. If either running statistic has
/// no registered trace value the export fails with
/// `Error::TraceLookupFailure` and the graph is left as it was.
pub fn export_batch_norm(
    ctx: &mut TraceContext,
    inputs: &[ValueId],
    op: &BatchNormSymbolic,
    loc: Option<SourceLocation>,
) -> Result<ValueId> {
    let [x, scale, bias] = match inputs {
        [x, scale, bias] => [*x, *scale, *bias],
        _ => bail!(
            "{BATCH_NORMALIZATION} export needs [x, scale, bias], got {} inputs",
            inputs.len()
        ),
    };
    let running_mean = ctx.buffer_trace(op.running_mean)?;
    let running_var = ctx.buffer_trace(op.running_var)?;
    let phase = op.phase();
    let index = ctx.next_batch_norm();

    let g = ctx.graph_mut();
    let bn = g.create(BATCH_NORMALIZATION, &[x, scale, bias], 0);
    g.set_source_location(bn, loc);
    g.append_node(bn)?;
    g.add_node_input(bn, running_mean);
    g.add_node_input(bn, running_var);
    g.set_i(bn, "is_test", i64::from(!phase.is_training()));
    g.set_f(bn, "epsilon", op.eps);
    g.set_f(bn, "momentum", 1.0 - op.momentum);

    let output = g.add_node_output(bn);
    if phase.is_training() {
        for stat in [running_mean, running_var] {
            let updated = g.add_node_output(bn);
            let ty = g.value_type(stat).clone();
            g.set_type(updated, ty);
        }
        for _ in 3..phase.output_arity() {
            let dead = g.add_node_output(bn);
            let name = format!("{DEAD_OUTPUT_PREFIX}{}", g.unique_name(dead));
            g.set_unique_name(dead, &name);
        }
    }
    g.set_is(bn, "consumed_inputs", &CONSUMED_INPUTS);
    g.set_node_name(bn, format!("batch_norm_{index}"));

    debug!(
        ?phase,
        index,
        outputs = g.node(bn).outputs().len(),
        "batch norm exported"
    );
    Ok(output)
}
