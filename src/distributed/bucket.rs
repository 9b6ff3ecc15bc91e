//! Bucketed data-parallel gradient all-reduce.
//!
//! Gradients become available in reverse layer order during backward, so
//! they are bucketed back to front. Buckets are flushed in exactly that
//! order; a gradient larger than the cap first flushes whatever is pending
//! and is then reduced on its own. Every rank derives the same flush
//! sequence from the same gradient list, which is what keeps the
//! collectives matched across ranks.

use crate::utils::error::{GradSyncError, Result};
use crate::utils::logging::rmsg;
use crate::utils::metrics;
use super::groups::{DistributedContext, ParallelAxis};
use super::ReduceOp;
use candle_core::{DType, Tensor};
use std::env;
use tracing::{debug, warn};

pub const DEFAULT_BUCKET_CAP_MB: usize = 512;

/// Environment variable holding the cap in megabytes.
pub const BUCKET_CAP_ENV: &str = "ALLREDUCE_BUCKET_CAP_MB";

const BYTES_PER_MB: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub cap_bytes: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self::from_megabytes(DEFAULT_BUCKET_CAP_MB)
    }
}

impl BucketConfig {
    /// Saturates at `usize::MAX` bytes.
    pub fn from_megabytes(mb: usize) -> Self {
        Self { cap_bytes: mb.saturating_mul(BYTES_PER_MB) }
    }

    /// `None` when `mb` megabytes do not fit in `usize` bytes.
    pub fn try_from_megabytes(mb: usize) -> Option<Self> {
        mb.checked_mul(BYTES_PER_MB).map(|cap_bytes| Self { cap_bytes })
    }

    /// Read `ALLREDUCE_BUCKET_CAP_MB`, falling back to 512 MiB.
    pub fn from_env() -> Self {
        Self::from_env_value(env::var(BUCKET_CAP_ENV).ok().as_deref())
    }

    pub fn from_env_value(value: Option<&str>) -> Self {
        let Some(raw) = value else { return Self::default() };
        match raw.trim().parse::<usize>().ok().and_then(Self::try_from_megabytes) {
            Some(config) => config,
            None => {
                warn!(
                    value = raw,
                    default_mb = DEFAULT_BUCKET_CAP_MB,
                    "Ignoring unusable {}",
                    BUCKET_CAP_ENV
                );
                Self::default()
            }
        }
    }
}

/// One flush: indices into the gradient list, all of one dtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub dtype: DType,
    pub indices: Vec<usize>,
    pub bytes: usize,
}

/// Flush sequence for gradients described as `(dtype, bytes)`.
///
/// Dtype groups are visited in order of first appearance; within a group
/// gradients are visited in reverse input order.
pub fn plan_buckets<I>(grads: I, cap_bytes: usize) -> Vec<Bucket>
where
    I: IntoIterator<Item = (DType, usize)>,
{
    let mut dtype_groups: Vec<(DType, Vec<(usize, usize)>)> = Vec::new();
    for (idx, (dtype, bytes)) in grads.into_iter().enumerate() {
        match dtype_groups.iter_mut().find(|(d, _)| *d == dtype) {
            Some((_, group)) => group.push((idx, bytes)),
            None => dtype_groups.push((dtype, vec![(idx, bytes)])),
        }
    }

    let mut plan = Vec::new();
    for (dtype, group) in dtype_groups {
        let mut pending: Vec<usize> = Vec::new();
        let mut total = 0usize;

        for &(idx, bytes) in group.iter().rev() {
            if bytes > cap_bytes {
                // Pending bucket goes first to keep strict reverse order
                if !pending.is_empty() {
                    plan.push(Bucket { dtype, indices: std::mem::take(&mut pending), bytes: total });
                    total = 0;
                }
                plan.push(Bucket { dtype, indices: vec![idx], bytes });
                continue;
            }

            total = total.saturating_add(bytes);
            if total > cap_bytes {
                plan.push(Bucket {
                    dtype,
                    indices: std::mem::take(&mut pending),
                    bytes: total - bytes,
                });
                total = bytes;
            }
            pending.push(idx);
        }

        if !pending.is_empty() {
            plan.push(Bucket { dtype, indices: pending, bytes: total });
        }
    }
    plan
}

pub fn grad_bytes(grad: &Tensor) -> usize {
    grad.elem_count() * grad.dtype().size_in_bytes()
}

/// Average gradients across the data-parallel group, bucket by bucket.
///
/// Each gradient is divided by the DP degree, then summed across the group.
/// Results replace the entries of `grads`. Returns the number of flushes.
pub fn bucket_allreduce_gradients(
    grads: &mut [Tensor],
    ctx: &DistributedContext,
    config: &BucketConfig,
) -> Result<usize> {
    let plan = plan_buckets(grads.iter().map(|g| (g.dtype(), grad_bytes(g))), config.cap_bytes);
    let dp = ctx.group_for(ParallelAxis::DataParallel);

    let mut dtype_counts: Vec<(DType, usize)> = Vec::new();
    for bucket in &plan {
        match dtype_counts.iter_mut().find(|(d, _)| *d == bucket.dtype) {
            Some((_, n)) => *n += bucket.indices.len(),
            None => dtype_counts.push((bucket.dtype, bucket.indices.len())),
        }
    }
    debug!("{}", rmsg(ctx, format!("reduce grads dtype_groups counts {:?}", dtype_counts)));

    for bucket in &plan {
        let mut tensors = Vec::with_capacity(bucket.indices.len());
        for &i in &bucket.indices {
            if dp.size > 1 {
                grads[i] = grads[i].affine(1.0 / dp.size as f64, 0.0)?;
            }
            tensors.push(grads[i].clone());
        }

        debug!(
            "{}",
            rmsg(
                ctx,
                format!(
                    "all_reduce {} {:?} tensors, {} bytes, with group {:?}",
                    tensors.len(),
                    bucket.dtype,
                    bucket.bytes,
                    dp.ranks
                )
            )
        );
        let reduced = dp.all_reduce_coalesced(&tensors, ReduceOp::Sum)?;
        if reduced.len() != bucket.indices.len() {
            return Err(GradSyncError::Communication(format!(
                "bucket of {} tensors came back with {}",
                bucket.indices.len(),
                reduced.len()
            )));
        }
        for (&i, t) in bucket.indices.iter().zip(reduced) {
            grads[i] = t;
        }
        metrics::record_bucket_flush(bucket.bytes);
    }

    Ok(plan.len())
}
