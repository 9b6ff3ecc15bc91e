//! Global gradient norm and clipping across TP/PP (and sharded-optimizer)
//! groups.
//!
//! Norms are accumulated in an F32 scalar on the context's device. Partial
//! results are reduced across groups before the root is taken, so every rank
//! in the reduced groups ends up with the same value.

use crate::training::optimizer::ParameterGroups;
use crate::utils::error::{GradSyncError, Result};
use crate::utils::logging::rmsg;
use crate::utils::metrics;
use super::classify::collect_grads_for_norm;
use super::groups::{DistributedContext, ParallelAxis, ShardedOptimizerGroups};
use super::param::Parameter;
use super::ReduceOp;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Added to the norm before dividing so a zero norm cannot blow up.
pub const CLIP_EPSILON: f64 = 1.0e-6;

/// Which norm to compute.
///
/// Serialised as a number, or the string `"inf"` for the infinity norm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NormTypeRepr", into = "NormTypeRepr")]
pub enum NormType {
    /// L-p norm, `p > 0`
    P(f64),
    /// Max absolute value
    Inf,
}

impl NormType {
    pub fn is_inf(self) -> bool {
        matches!(self, NormType::Inf)
    }
}

impl Default for NormType {
    fn default() -> Self {
        NormType::P(2.0)
    }
}

impl From<f64> for NormType {
    fn from(p: f64) -> Self {
        if p.is_infinite() {
            NormType::Inf
        } else {
            NormType::P(p)
        }
    }
}

impl FromStr for NormType {
    type Err = GradSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "inf" | "infinity" => Ok(NormType::Inf),
            other => other
                .parse::<f64>()
                .map(NormType::from)
                .map_err(|_| GradSyncError::Config(format!("invalid norm type: {}", s))),
        }
    }
}

impl fmt::Display for NormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormType::P(p) => write!(f, "{}", p),
            NormType::Inf => write!(f, "inf"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum NormTypeRepr {
    Number(f64),
    Name(String),
}

impl TryFrom<NormTypeRepr> for NormType {
    type Error = String;

    fn try_from(repr: NormTypeRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            NormTypeRepr::Number(p) => Ok(NormType::from(p)),
            NormTypeRepr::Name(s) => s.parse().map_err(|e: GradSyncError| e.to_string()),
        }
    }
}

impl From<NormType> for NormTypeRepr {
    fn from(norm_type: NormType) -> Self {
        match norm_type {
            NormType::P(p) => NormTypeRepr::Number(p),
            NormType::Inf => NormTypeRepr::Name("inf".to_string()),
        }
    }
}

/// Knobs for [`compute_grad_norm`] and [`clip_grad_norm`].
#[derive(Debug, Clone, Copy)]
pub struct NormOptions<'a> {
    pub norm_type: NormType,
    /// A sharded ("zero-1") optimizer is in use. Without explicit groups the
    /// norm is reduced over the whole world.
    pub sharded_optimizer: bool,
    /// Explicit sharded-optimizer grouping. Only valid with `sharded_optimizer`.
    pub sharded_optimizer_groups: Option<&'a ShardedOptimizerGroups>,
    /// Count TP-replicated gradients on every TP rank and divide their
    /// contribution by the TP degree. Tiny gradients can lose precision in
    /// the division.
    pub force_spmd: bool,
}

impl Default for NormOptions<'_> {
    fn default() -> Self {
        Self {
            norm_type: NormType::default(),
            sharded_optimizer: false,
            sharded_optimizer_groups: None,
            force_spmd: true,
        }
    }
}

impl<'a> NormOptions<'a> {
    pub fn new(norm_type: impl Into<NormType>) -> Self {
        Self { norm_type: norm_type.into(), ..Default::default() }
    }

    pub fn with_force_spmd(mut self, force_spmd: bool) -> Self {
        self.force_spmd = force_spmd;
        self
    }

    pub fn with_sharded_optimizer(mut self, groups: Option<&'a ShardedOptimizerGroups>) -> Self {
        self.sharded_optimizer = true;
        self.sharded_optimizer_groups = groups;
        self
    }

    /// `force_spmd` as the norm engine applies it: always on for the
    /// infinity norm.
    pub fn effective_force_spmd(&self) -> bool {
        self.force_spmd || self.norm_type.is_inf()
    }
}

/// Total norm of all eligible gradients, viewed as one vector.
///
/// The infinity norm always runs with `force_spmd` on, whatever the caller
/// asked for. MAX is unaffected by duplicates, so this changes which grads
/// are inspected but not the result.
///
/// Fails with `InvalidConfiguration`, before any collective, when sharded
/// optimizer groups are passed without the sharded optimizer.
pub fn compute_grad_norm<'p, I>(
    params: I,
    ctx: &DistributedContext,
    opts: &NormOptions<'_>,
) -> Result<f64>
where
    I: IntoIterator<Item = &'p Parameter>,
{
    let force_spmd = opts.effective_force_spmd();

    if !opts.sharded_optimizer && opts.sharded_optimizer_groups.is_some() {
        return Err(GradSyncError::InvalidConfiguration(
            "sharded_optimizer_groups given while sharded_optimizer is false; \
             without the sharded optimizer, clipping is handled by the optimizer"
                .to_string(),
        ));
    }
    if let NormType::P(p) = opts.norm_type {
        if p.is_nan() || p <= 0.0 {
            return Err(GradSyncError::InvalidConfiguration(format!(
                "norm type must be positive, got {}",
                p
            )));
        }
    }

    let device = ctx.device();
    let grads = collect_grads_for_norm(params, force_spmd, ctx);

    let total = match opts.norm_type {
        NormType::Inf => {
            let tp_duplicated = max_abs(&grads.tp_duplicated, device)?;
            let partitioned = max_abs(&grads.partitioned, device)?;
            let local = tp_duplicated.maximum(&partitioned)?;
            reduce_across_parallel_groups(local, ReduceOp::Max, ctx, opts)?
        }
        NormType::P(p) => {
            let mut local = Tensor::zeros((), DType::F32, device)?;
            if force_spmd {
                let duplicated = sum_of_powers(&grads.tp_duplicated, p, device)?;
                local = duplicated.affine(1.0 / ctx.tp_size() as f64, 0.0)?;
            }
            local = local.add(&sum_of_powers(&grads.partitioned, p, device)?)?;
            let total = reduce_across_parallel_groups(local, ReduceOp::Sum, ctx, opts)?;
            total.powf(1.0 / p)?
        }
    };

    let total_norm = total.to_scalar::<f32>()? as f64;
    debug!(
        "{}",
        rmsg(
            ctx,
            format!(
                "grad norm {} = {} over {} partitioned, {} tp-duplicated grads (force_spmd={})",
                opts.norm_type,
                total_norm,
                grads.partitioned.len(),
                grads.tp_duplicated.len(),
                force_spmd
            )
        )
    );
    metrics::record_grad_norm(total_norm);
    Ok(total_norm)
}

/// `min(max_norm / (total_norm + eps), 1)`.
pub fn clip_coefficient(total_norm: f64, max_norm: f64) -> f64 {
    // f64::min drops NaN, so a NaN norm leaves grads untouched
    (max_norm / (total_norm + CLIP_EPSILON)).min(1.0)
}

/// Clip all present gradients so their global norm is at most `max_norm`.
///
/// Every gradient is scaled by the same coefficient, including shared and
/// duplicated ones that did not count toward the norm. Returns the norm
/// measured before clipping.
pub fn clip_grad_norm(
    params: &mut [Parameter],
    max_norm: f64,
    ctx: &DistributedContext,
    opts: &NormOptions<'_>,
) -> Result<f64> {
    let total_norm = compute_grad_norm(params.iter(), ctx, opts)?;
    let coeff = finish_clip(total_norm, max_norm, ctx);
    scale_grads(params.iter_mut(), coeff)?;
    Ok(total_norm)
}

/// [`clip_grad_norm`] over every group of an optimizer.
///
/// Returns the pre-clip norm and the coefficient applied.
pub fn clip_parameter_groups<O>(
    optimizer: &mut O,
    max_norm: f64,
    ctx: &DistributedContext,
    opts: &NormOptions<'_>,
) -> Result<(f64, f64)>
where
    O: ParameterGroups + ?Sized,
{
    let total_norm = compute_grad_norm(optimizer.parameters(), ctx, opts)?;
    let coeff = finish_clip(total_norm, max_norm, ctx);
    for group in optimizer.parameter_groups_mut() {
        scale_grads(group.params.iter_mut(), coeff)?;
    }
    Ok((total_norm, coeff))
}

fn finish_clip(total_norm: f64, max_norm: f64, ctx: &DistributedContext) -> f64 {
    let coeff = clip_coefficient(total_norm, max_norm);
    debug!(
        "{}",
        rmsg(ctx, format!("clip: total_norm={} max_norm={} coeff={}", total_norm, max_norm, coeff))
    );
    metrics::record_clip_coefficient(coeff);
    coeff
}

/// Multiply every present gradient by `coeff`, keeping its dtype.
pub fn scale_grads<'p, I>(params: I, coeff: f64) -> Result<()>
where
    I: IntoIterator<Item = &'p mut Parameter>,
{
    // Scaling by exactly 1.0 is the identity
    if coeff >= 1.0 {
        return Ok(());
    }
    for grad in params.into_iter().filter_map(|p| p.grad.as_mut()) {
        *grad = grad.affine(coeff, 0.0)?;
    }
    Ok(())
}

/// Reduce a partial norm across the groups that split the parameters.
///
/// Sharded optimizer without explicit groups: the world group only.
/// Otherwise TP (if > 1), then PP (if > 1), then the explicit sharded groups
/// via the layout-pinned path. Every rank issues the same sequence.
fn reduce_across_parallel_groups(
    total: Tensor,
    op: ReduceOp,
    ctx: &DistributedContext,
    opts: &NormOptions<'_>,
) -> Result<Tensor> {
    if opts.sharded_optimizer && opts.sharded_optimizer_groups.is_none() {
        return ctx.world_group().all_reduce(&total, op);
    }

    let mut total = total;
    for axis in [ParallelAxis::TensorParallel, ParallelAxis::PipelineParallel] {
        let group = ctx.group_for(axis);
        if group.size > 1 {
            total = group.all_reduce(&total, op)?;
        }
    }

    if let Some(sharded) = opts.sharded_optimizer_groups {
        total = sharded
            .group
            .all_reduce_pinned(&[total], op)?
            .pop()
            .ok_or_else(|| {
                GradSyncError::Communication("pinned all-reduce returned no tensor".to_string())
            })?;
    }
    Ok(total)
}

/// Σ |g|^p over all grads, as an F32 scalar on `device`.
fn sum_of_powers(grads: &[&Tensor], p: f64, device: &Device) -> Result<Tensor> {
    let mut acc = Tensor::zeros((), DType::F32, device)?;
    for grad in grads {
        let g = grad.to_device(device)?.to_dtype(DType::F32)?;
        let term = if p == 2.0 {
            g.sqr()?.sum_all()?
        } else if p == 1.0 {
            g.abs()?.sum_all()?
        } else {
            g.abs()?.powf(p)?.sum_all()?
        };
        acc = acc.add(&term)?;
    }
    Ok(acc)
}

/// max |g| over all grads, 0 when there are none.
fn max_abs(grads: &[&Tensor], device: &Device) -> Result<Tensor> {
    let mut acc = Tensor::zeros((), DType::F32, device)?;
    for grad in grads.iter().filter(|g| g.elem_count() > 0) {
        let m = grad
            .to_device(device)?
            .to_dtype(DType::F32)?
            .abs()?
            .flatten_all()?
            .max(0)?;
        acc = acc.maximum(&m)?;
    }
    Ok(acc)
}
