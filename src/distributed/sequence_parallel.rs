//! Re-synchronising sequence-parallel gradients across the TP group.
//!
//! With sequence parallelism each TP rank only sees a slice of the
//! sequence, so parameters like layer norms end up with partial gradients.
//! They are summed across the TP group here; the DP bucketed reduction does
//! not cover them.

use crate::training::optimizer::ParameterGroups;
use crate::utils::error::Result;
use crate::utils::logging::rmsg;
use super::groups::{DistributedContext, ParallelAxis};
use super::ReduceOp;
use tracing::debug;

/// Sum the gradients of every `sequence_parallel_enabled` parameter across
/// the TP group, one collective per gradient. No-op when TP size is 1.
///
/// Returns the number of gradients reduced.
pub fn allreduce_sequence_parallel_gradients<O>(optimizer: &mut O, ctx: &DistributedContext) -> Result<usize>
where
    O: ParameterGroups + ?Sized,
{
    let tp = ctx.group_for(ParallelAxis::TensorParallel);
    if tp.size <= 1 {
        return Ok(0);
    }

    let mut reduced = 0;
    for group in optimizer.parameter_groups_mut() {
        for param in group.params.iter_mut().filter(|p| p.meta.sequence_parallel_enabled) {
            if let Some(grad) = param.grad.as_mut() {
                *grad = tp.all_reduce(grad, ReduceOp::Sum)?;
                reduced += 1;
            }
        }
    }

    debug!("{}", rmsg(ctx, format!("reduced {} sequence parallel grads across tp", reduced)));
    Ok(reduced)
}
