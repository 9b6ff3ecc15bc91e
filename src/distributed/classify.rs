//! Sorting gradients into the buckets the norm engine treats differently.

use super::groups::DistributedContext;
use super::param::Parameter;
use candle_core::Tensor;

/// How a parameter's gradient contributes to the global norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradClass {
    /// No gradient, shared, or a TP duplicate this rank does not own.
    Excluded,
    /// Counted as-is: partitioned across TP, or owned by this rank.
    Partitioned,
    /// Identical on every TP rank; scaled by `1 / tp_size` before the TP
    /// reduction.
    TpDuplicated,
}

/// Classify one parameter.
///
/// `force_spmd` makes every TP rank count replicated parameters and
/// compensate by the TP degree, instead of letting TP rank 0 count them.
pub fn classify(param: &Parameter, force_spmd: bool, ctx: &DistributedContext) -> GradClass {
    if param.grad.is_none() || param.meta.shared {
        return GradClass::Excluded;
    }

    let is_not_tp_duplicate = !ctx.is_tensor_parallel_duplicate(param);
    if param.meta.tensor_model_parallel || (is_not_tp_duplicate && !force_spmd) {
        GradClass::Partitioned
    } else if force_spmd {
        GradClass::TpDuplicated
    } else {
        GradClass::Excluded
    }
}

/// Gradients that feed the norm, split by class. Borrowed from the params.
#[derive(Debug, Default)]
pub struct GradsForNorm<'a> {
    pub partitioned: Vec<&'a Tensor>,
    pub tp_duplicated: Vec<&'a Tensor>,
}

pub fn collect_grads_for_norm<'a, I>(
    params: I,
    force_spmd: bool,
    ctx: &DistributedContext,
) -> GradsForNorm<'a>
where
    I: IntoIterator<Item = &'a Parameter>,
{
    let mut out = GradsForNorm::default();
    for param in params {
        let Some(grad) = param.grad.as_ref() else { continue };
        match classify(param, force_spmd, ctx) {
            GradClass::Partitioned => out.partitioned.push(grad),
            GradClass::TpDuplicated => out.tp_duplicated.push(grad),
            GradClass::Excluded => {}
        }
    }
    out
}
