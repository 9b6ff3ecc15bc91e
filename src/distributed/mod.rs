//! Distributed gradient plumbing.
//!
//! Parallelism axes covered here:
//! - Tensor Parallelism (TP)
//! - Pipeline Parallelism (PP)
//! - Data Parallelism (DP)
//! - Sharded optimizer ("zero-1") groups, an optional custom partition
//!
//! Every collective is a barrier across its group. All ranks must issue
//! collectives on a given group in the same order or the run hangs.

use candle_core::{Result, Tensor};

/// Reduction applied by an all-reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// Trait for collective communications.
///
/// Implementations include:
/// - `LocalCommunicator`: In-process simulation, one thread per rank
///
/// Results are returned rather than written through the inputs; callers
/// store them back into the slots they reduced.
pub trait CollectiveCommunicator: Send + Sync {
    /// Rank of this process within the communicator
    fn rank(&self) -> usize;

    /// Number of processes in the communicator
    fn world_size(&self) -> usize;

    /// Reduce a list of tensors as one collective call.
    ///
    /// Element `i` of the result is the reduction of element `i` across ranks.
    fn all_reduce_coalesced(&self, tensors: &[Tensor], op: ReduceOp) -> Result<Vec<Tensor>>;

    /// All-reduce a single tensor.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let mut out = self.all_reduce_coalesced(std::slice::from_ref(tensor), op)?;
        out.pop()
            .ok_or_else(|| candle_core::Error::Msg("all_reduce returned no tensor".to_string()))
    }

    /// Layout-pinned all-reduce, used for explicit sharded-optimizer groups.
    ///
    /// Inputs are made contiguous first so every rank ships the same memory
    /// layout.
    fn all_reduce_pinned(&self, tensors: &[Tensor], op: ReduceOp) -> Result<Vec<Tensor>> {
        let pinned = tensors
            .iter()
            .map(|t| t.contiguous())
            .collect::<Result<Vec<_>>>()?;
        self.all_reduce_coalesced(&pinned, op)
    }
}

pub mod backend;
pub mod bucket;
pub mod classify;
pub mod grads;
pub mod groups;
pub mod param;
pub mod sequence_parallel;

pub use backend::LocalCommunicator;
pub use bucket::{bucket_allreduce_gradients, plan_buckets, Bucket, BucketConfig};
pub use classify::{classify, collect_grads_for_norm, GradClass, GradsForNorm};
pub use grads::{
    clip_coefficient, clip_grad_norm, clip_parameter_groups, compute_grad_norm, scale_grads,
    NormOptions, NormType, CLIP_EPSILON,
};
pub use groups::{
    axis_groups, AxisGroups, DistributedContext, ParallelAxis, ParallelismConfig, ProcessGroup,
    ShardedOptimizerGroups,
};
pub use param::{params_from_varmap, ParallelMeta, Parameter};
pub use sequence_parallel::allreduce_sequence_parallel_gradients;
