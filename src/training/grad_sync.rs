//! One gradient synchronisation step, run between backward and the
//! optimizer update.

use crate::distributed::bucket::bucket_allreduce_gradients;
use crate::distributed::grads::clip_parameter_groups;
use crate::distributed::groups::DistributedContext;
use crate::distributed::sequence_parallel::allreduce_sequence_parallel_gradients;
use crate::training::optimizer::ParameterGroups;
use crate::utils::config::GradSyncConfig;
use crate::utils::error::Result;
use crate::utils::logging::rmsg;
use candle_core::Tensor;
use tracing::info;

/// What a call to [`prepare_gradients`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradSyncReport {
    pub sequence_parallel_reduced: usize,
    pub buckets_flushed: usize,
    /// Norm before clipping; `None` when clipping is off
    pub total_norm: Option<f64>,
    pub clip_coefficient: Option<f64>,
}

/// Sequence-parallel reduce (if enabled), bucketed DP reduce over all present
/// grads in parameter order, then clip (if `max_grad_norm` is set).
///
/// Gradients stay attached to their parameters even when a collective fails.
pub fn prepare_gradients<O>(
    optimizer: &mut O,
    ctx: &DistributedContext,
    config: &GradSyncConfig,
) -> Result<GradSyncReport>
where
    O: ParameterGroups + ?Sized,
{
    let mut report = GradSyncReport::default();

    if config.sequence_parallel {
        report.sequence_parallel_reduced = allreduce_sequence_parallel_gradients(optimizer, ctx)?;
    }

    let (slots, mut grads) = take_grads(optimizer);
    let reduced = bucket_allreduce_gradients(&mut grads, ctx, &config.bucket_config());
    restore_grads(optimizer, &slots, grads);
    report.buckets_flushed = reduced?;

    if let Some(max_norm) = config.max_grad_norm {
        let opts = config.norm_options(ctx);
        let (total_norm, coeff) = clip_parameter_groups(optimizer, max_norm, ctx, &opts)?;
        report.total_norm = Some(total_norm);
        report.clip_coefficient = Some(coeff);
    }

    info!(
        "{}",
        rmsg(
            ctx,
            format!(
                "grad sync: sp_reduced={} buckets={} total_norm={:?} coeff={:?}",
                report.sequence_parallel_reduced,
                report.buckets_flushed,
                report.total_norm,
                report.clip_coefficient
            )
        )
    );
    Ok(report)
}

/// Detach every present grad, remembering `(group, param)` for each.
fn take_grads<O>(optimizer: &mut O) -> (Vec<(usize, usize)>, Vec<Tensor>)
where
    O: ParameterGroups + ?Sized,
{
    let mut slots = Vec::new();
    let mut grads = Vec::new();
    for (g, group) in optimizer.parameter_groups_mut().iter_mut().enumerate() {
        for (p, param) in group.params.iter_mut().enumerate() {
            if let Some(grad) = param.grad.take() {
                slots.push((g, p));
                grads.push(grad);
            }
        }
    }
    (slots, grads)
}

fn restore_grads<O>(optimizer: &mut O, slots: &[(usize, usize)], grads: Vec<Tensor>)
where
    O: ParameterGroups + ?Sized,
{
    let groups = optimizer.parameter_groups_mut();
    for (&(g, p), grad) in slots.iter().zip(grads) {
        groups[g].params[p].grad = Some(grad);
    }
}
