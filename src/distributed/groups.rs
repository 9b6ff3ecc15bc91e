//! Process group topology.
//!
//! Holds one process group per parallelism axis:
//! - Tensor Parallel (TP) group
//! - Pipeline Parallel (PP) group
//! - Data Parallel (DP) group
//! - optional sharded-optimizer groups (a custom partition of the world)
//!
//! Everything hangs off an explicit [`DistributedContext`] that the training
//! loop passes into each operation. Membership never changes after the
//! context is built.

use crate::utils::error::{GradSyncError, Result};
use crate::utils::metrics;
use super::backend::LocalCommunicator;
use super::param::Parameter;
use super::{CollectiveCommunicator, ReduceOp};
use candle_core::{Device, Tensor};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Process group handle
#[derive(Clone)]
pub struct ProcessGroup {
    /// Communicator for this group
    pub communicator: Arc<dyn CollectiveCommunicator>,
    /// Global ranks in this group, ordered by local rank
    pub ranks: Vec<usize>,
    /// Size of this group
    pub size: usize,
    /// Short name used in logs and metrics ("tp", "dp", ...)
    pub label: &'static str,
}

impl ProcessGroup {
    pub fn new(communicator: Arc<dyn CollectiveCommunicator>, ranks: Vec<usize>) -> Self {
        let size = ranks.len();
        Self { communicator, ranks, size, label: "group" }
    }

    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    /// Get local rank within this group
    pub fn local_rank(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global_rank)
    }

    pub fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        self.timed(|| self.communicator.all_reduce(tensor, op))
    }

    pub fn all_reduce_coalesced(&self, tensors: &[Tensor], op: ReduceOp) -> Result<Vec<Tensor>> {
        self.timed(|| self.communicator.all_reduce_coalesced(tensors, op))
    }

    pub fn all_reduce_pinned(&self, tensors: &[Tensor], op: ReduceOp) -> Result<Vec<Tensor>> {
        self.timed(|| self.communicator.all_reduce_pinned(tensors, op))
    }

    fn timed<T>(&self, f: impl FnOnce() -> candle_core::Result<T>) -> Result<T> {
        let start = Instant::now();
        let out = f().map_err(|e| {
            GradSyncError::Communication(format!("{} all-reduce failed: {}", self.label, e))
        })?;
        metrics::record_collective(self.label, start.elapsed().as_secs_f64());
        Ok(out)
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("label", &self.label)
            .field("ranks", &self.ranks)
            .finish()
    }
}

/// Parallelism axes that partition the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParallelAxis {
    TensorParallel,
    PipelineParallel,
    DataParallel,
}

impl ParallelAxis {
    pub const ALL: [ParallelAxis; 3] = [
        ParallelAxis::TensorParallel,
        ParallelAxis::PipelineParallel,
        ParallelAxis::DataParallel,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ParallelAxis::TensorParallel => "tp",
            ParallelAxis::PipelineParallel => "pp",
            ParallelAxis::DataParallel => "dp",
        }
    }
}

/// Parallelism configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelismConfig {
    pub world_size: usize,
    pub dp_size: usize,
    pub tp_size: usize,
    pub pp_size: usize,
}

impl ParallelismConfig {
    pub fn new(world_size: usize, dp_size: usize, tp_size: usize, pp_size: usize) -> Result<Self> {
        if dp_size == 0 || tp_size == 0 || pp_size == 0 {
            return Err(GradSyncError::Distributed(format!(
                "parallel degrees must be >= 1, got DP({}) TP({}) PP({})",
                dp_size, tp_size, pp_size
            )));
        }

        let computed = dp_size * tp_size * pp_size;
        if computed != world_size {
            return Err(GradSyncError::Distributed(format!(
                "DP({}) x TP({}) x PP({}) = {} != world_size({})",
                dp_size, tp_size, pp_size, computed, world_size
            )));
        }

        Ok(Self { world_size, dp_size, tp_size, pp_size })
    }

    pub fn single_device() -> Self {
        Self { world_size: 1, dp_size: 1, tp_size: 1, pp_size: 1 }
    }

    pub fn degree(&self, axis: ParallelAxis) -> usize {
        match axis {
            ParallelAxis::TensorParallel => self.tp_size,
            ParallelAxis::PipelineParallel => self.pp_size,
            ParallelAxis::DataParallel => self.dp_size,
        }
    }
}

/// Partition all world ranks into groups along `axis`.
///
/// Ranks are laid out as `pp_rank * (dp * tp) + dp_rank * tp + tp_rank`, so
/// TP groups are contiguous, DP groups stride by `tp` inside one pipeline
/// stage and PP groups stride by a whole stage.
pub fn axis_groups(config: &ParallelismConfig, axis: ParallelAxis) -> Vec<Vec<usize>> {
    let world = config.world_size;
    let tp = config.tp_size;
    let stage = world / config.pp_size;

    match axis {
        ParallelAxis::TensorParallel => {
            (0..world / tp).map(|i| (i * tp..(i + 1) * tp).collect()).collect()
        }
        ParallelAxis::DataParallel => {
            let mut groups = Vec::with_capacity(config.pp_size * tp);
            for i in 0..config.pp_size {
                let start = i * stage;
                for j in 0..tp {
                    groups.push((start + j..start + stage).step_by(tp).collect());
                }
            }
            groups
        }
        ParallelAxis::PipelineParallel => {
            (0..stage).map(|i| (i..world).step_by(stage).collect()).collect()
        }
    }
}

/// Explicit sharded-optimizer grouping.
///
/// `ranks` is the full partition (every world rank exactly once), `group` the
/// member this rank belongs to.
#[derive(Debug, Clone)]
pub struct ShardedOptimizerGroups {
    pub ranks: Vec<Vec<usize>>,
    pub group: ProcessGroup,
}

impl ShardedOptimizerGroups {
    pub fn new(ranks: Vec<Vec<usize>>, group: ProcessGroup) -> Result<Self> {
        if !ranks.iter().any(|g| *g == group.ranks) {
            return Err(GradSyncError::InvalidConfiguration(format!(
                "sharded optimizer group {:?} is not one of {:?}",
                group.ranks, ranks
            )));
        }
        Ok(Self { ranks, group: group.with_label("sharded") })
    }
}

/// Check that `ranks` partitions `0..world_size`.
pub fn validate_partition(ranks: &[Vec<usize>], world_size: usize) -> Result<()> {
    let mut seen = vec![false; world_size];
    for group in ranks {
        if group.is_empty() {
            return Err(GradSyncError::InvalidConfiguration(
                "sharded optimizer groups must not be empty".to_string(),
            ));
        }
        for &r in group {
            if r >= world_size {
                return Err(GradSyncError::InvalidConfiguration(format!(
                    "rank {} in sharded optimizer groups exceeds world size {}",
                    r, world_size
                )));
            }
            if seen[r] {
                return Err(GradSyncError::InvalidConfiguration(format!(
                    "rank {} appears in more than one sharded optimizer group",
                    r
                )));
            }
            seen[r] = true;
        }
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(GradSyncError::InvalidConfiguration(format!(
            "rank {} is not covered by the sharded optimizer groups",
            missing
        )));
    }
    Ok(())
}

/// The groups a single rank participates in.
#[derive(Debug, Clone)]
pub struct AxisGroups {
    pub world: ProcessGroup,
    pub tensor: ProcessGroup,
    pub pipeline: ProcessGroup,
    pub data: ProcessGroup,
}

/// Per-rank view of the distributed runtime.
#[derive(Debug, Clone)]
pub struct DistributedContext {
    rank: usize,
    config: ParallelismConfig,
    device: Device,
    world: ProcessGroup,
    tensor: ProcessGroup,
    pipeline: ProcessGroup,
    data: ProcessGroup,
    sharded: Option<ShardedOptimizerGroups>,
}

impl DistributedContext {
    pub fn new(
        rank: usize,
        config: ParallelismConfig,
        device: Device,
        groups: AxisGroups,
    ) -> Result<Self> {
        if groups.world.size != config.world_size {
            return Err(GradSyncError::Distributed(format!(
                "world group has {} ranks, config expects {}",
                groups.world.size, config.world_size
            )));
        }

        let ctx = Self {
            rank,
            world: groups.world.with_label("world"),
            tensor: groups.tensor.with_label("tp"),
            pipeline: groups.pipeline.with_label("pp"),
            data: groups.data.with_label("dp"),
            config,
            device,
            sharded: None,
        };

        for axis in ParallelAxis::ALL {
            let group = ctx.group_for(axis);
            let expected = ctx.config.degree(axis);
            if group.size != expected {
                return Err(GradSyncError::Distributed(format!(
                    "{} group has {} ranks, config expects {}",
                    axis.label(),
                    group.size,
                    expected
                )));
            }
            if group.local_rank(rank).is_none() {
                return Err(GradSyncError::Distributed(format!(
                    "rank {} is not a member of its {} group {:?}",
                    rank,
                    axis.label(),
                    group.ranks
                )));
            }
        }

        Ok(ctx)
    }

    /// Context for a lone process: every group is a single-rank group.
    pub fn single_device(device: Device) -> Self {
        let comm: Arc<dyn CollectiveCommunicator> =
            Arc::new(LocalCommunicator::new_group(1).remove(0));
        let group = ProcessGroup::new(comm, vec![0]);
        Self {
            rank: 0,
            config: ParallelismConfig::single_device(),
            device,
            world: group.clone().with_label("world"),
            tensor: group.clone().with_label("tp"),
            pipeline: group.clone().with_label("pp"),
            data: group.with_label("dp"),
            sharded: None,
        }
    }

    pub fn with_sharded_optimizer_groups(mut self, groups: ShardedOptimizerGroups) -> Result<Self> {
        validate_partition(&groups.ranks, self.config.world_size)?;
        if groups.group.local_rank(self.rank).is_none() {
            return Err(GradSyncError::InvalidConfiguration(format!(
                "rank {} is not a member of its sharded optimizer group {:?}",
                self.rank, groups.group.ranks
            )));
        }
        self.sharded = Some(groups);
        Ok(self)
    }

    /// Build one context per world rank, wired to in-process communicators.
    ///
    /// Each returned context must be driven from its own thread.
    pub fn local_grid(config: ParallelismConfig, device: Device) -> Result<Vec<Self>> {
        Self::build_local_grid(config, None, device)
    }

    pub fn local_grid_with_sharded_groups(
        config: ParallelismConfig,
        sharded_ranks: Vec<Vec<usize>>,
        device: Device,
    ) -> Result<Vec<Self>> {
        Self::build_local_grid(config, Some(sharded_ranks), device)
    }

    fn build_local_grid(
        config: ParallelismConfig,
        sharded_ranks: Option<Vec<Vec<usize>>>,
        device: Device,
    ) -> Result<Vec<Self>> {
        let world_size = config.world_size;
        if let Some(ranks) = &sharded_ranks {
            validate_partition(ranks, world_size)?;
        }

        info!(
            world_size = world_size,
            dp = config.dp_size,
            tp = config.tp_size,
            pp = config.pp_size,
            sharded_optimizer_groups = sharded_ranks.as_ref().map(|g| g.len()),
            "Building local process grid"
        );

        let world = local_groups(&[(0..world_size).collect()], world_size);
        let tensor = local_groups(&axis_groups(&config, ParallelAxis::TensorParallel), world_size);
        let pipeline = local_groups(&axis_groups(&config, ParallelAxis::PipelineParallel), world_size);
        let data = local_groups(&axis_groups(&config, ParallelAxis::DataParallel), world_size);
        let sharded = sharded_ranks.as_ref().map(|ranks| local_groups(ranks, world_size));

        let mut contexts = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let groups = AxisGroups {
                world: pick(&world, rank, "world")?,
                tensor: pick(&tensor, rank, "tp")?,
                pipeline: pick(&pipeline, rank, "pp")?,
                data: pick(&data, rank, "dp")?,
            };
            let mut ctx = Self::new(rank, config.clone(), device.clone(), groups)?;
            if let (Some(ranks), Some(slots)) = (&sharded_ranks, &sharded) {
                let group = ShardedOptimizerGroups::new(ranks.clone(), pick(slots, rank, "sharded")?)?;
                ctx = ctx.with_sharded_optimizer_groups(group)?;
            }
            contexts.push(ctx);
        }
        Ok(contexts)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn config(&self) -> &ParallelismConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn world_group(&self) -> &ProcessGroup {
        &self.world
    }

    pub fn group_for(&self, axis: ParallelAxis) -> &ProcessGroup {
        match axis {
            ParallelAxis::TensorParallel => &self.tensor,
            ParallelAxis::PipelineParallel => &self.pipeline,
            ParallelAxis::DataParallel => &self.data,
        }
    }

    pub fn size_of(&self, axis: ParallelAxis) -> usize {
        self.group_for(axis).size
    }

    /// Local rank along `axis`. Membership is checked at construction.
    pub fn rank_in(&self, axis: ParallelAxis) -> usize {
        self.group_for(axis).local_rank(self.rank).unwrap_or(0)
    }

    pub fn sharded_optimizer_groups(&self) -> Option<&ShardedOptimizerGroups> {
        self.sharded.as_ref()
    }

    pub fn tp_size(&self) -> usize {
        self.size_of(ParallelAxis::TensorParallel)
    }

    pub fn tp_rank(&self) -> usize {
        self.rank_in(ParallelAxis::TensorParallel)
    }

    pub fn pp_size(&self) -> usize {
        self.size_of(ParallelAxis::PipelineParallel)
    }

    pub fn pp_rank(&self) -> usize {
        self.rank_in(ParallelAxis::PipelineParallel)
    }

    pub fn dp_size(&self) -> usize {
        self.size_of(ParallelAxis::DataParallel)
    }

    pub fn dp_rank(&self) -> usize {
        self.rank_in(ParallelAxis::DataParallel)
    }

    /// Whether this rank's copy of `param` is a tensor-parallel duplicate.
    ///
    /// Partitioned parameters are never duplicates. Replicated parameters
    /// are owned by TP rank 0; every other TP rank holds a duplicate.
    pub fn is_tensor_parallel_duplicate(&self, param: &Parameter) -> bool {
        !param.meta.tensor_model_parallel && self.tp_rank() != 0
    }
}

fn pick(slots: &[Option<ProcessGroup>], rank: usize, name: &str) -> Result<ProcessGroup> {
    slots[rank].clone().ok_or_else(|| {
        GradSyncError::Distributed(format!("rank {} has no {} group", rank, name))
    })
}

/// For each world rank, the local group it belongs to within `partition`.
fn local_groups(partition: &[Vec<usize>], world_size: usize) -> Vec<Option<ProcessGroup>> {
    let mut slots: Vec<Option<ProcessGroup>> = vec![None; world_size];
    for ranks in partition {
        let comms = LocalCommunicator::new_group(ranks.len());
        for (comm, &global) in comms.into_iter().zip(ranks.iter()) {
            let comm: Arc<dyn CollectiveCommunicator> = Arc::new(comm);
            slots[global] = Some(ProcessGroup::new(comm, ranks.clone()));
        }
    }
    slots
}
