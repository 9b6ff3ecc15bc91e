//! Gradient synchronisation for SPMD training across tensor, pipeline and
//! data parallel process groups.
//!
//! The training loop hands this crate its parameters (with gradients and
//! parallelism metadata attached) together with an explicit
//! [`DistributedContext`](distributed::DistributedContext). The crate then
//! computes global gradient norms, clips, and reduces gradients in
//! size-bounded buckets across the data-parallel group.

pub mod distributed;
pub mod training;
pub mod utils;

pub use distributed::{
    allreduce_sequence_parallel_gradients, bucket_allreduce_gradients, clip_grad_norm,
    compute_grad_norm, BucketConfig, DistributedContext, NormOptions, NormType, ParallelAxis,
    ParallelMeta, Parameter, ParallelismConfig, ProcessGroup, ReduceOp,
};
pub use training::{prepare_gradients, GradSyncReport, ParamGroup, ParameterGroups};
pub use utils::error::{GradSyncError, Result};
