#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use spmd_grads::distributed::{
    AxisGroups, CollectiveCommunicator, DistributedContext, LocalCommunicator, ParallelismConfig,
    ProcessGroup, ReduceOp,
};
use std::sync::{Arc, Mutex};

/// One collective call as seen by a [`RecordingCommunicator`].
#[derive(Debug, Clone)]
pub struct Call {
    pub op: ReduceOp,
    pub elem_counts: Vec<usize>,
    pub dtypes: Vec<DType>,
}

#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<Call>>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// Forwards to an inner communicator and logs every call.
pub struct RecordingCommunicator {
    inner: Arc<dyn CollectiveCommunicator>,
    log: Arc<CallLog>,
}

impl CollectiveCommunicator for RecordingCommunicator {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn world_size(&self) -> usize {
        self.inner.world_size()
    }

    fn all_reduce_coalesced(&self, tensors: &[Tensor], op: ReduceOp) -> candle_core::Result<Vec<Tensor>> {
        self.log.calls.lock().unwrap().push(Call {
            op,
            elem_counts: tensors.iter().map(|t| t.elem_count()).collect(),
            dtypes: tensors.iter().map(|t| t.dtype()).collect(),
        });
        self.inner.all_reduce_coalesced(tensors, op)
    }
}

/// Single-rank context whose groups all log into one shared [`CallLog`].
pub fn recording_single_device() -> (DistributedContext, Arc<CallLog>) {
    let log = Arc::new(CallLog::default());
    let inner: Arc<dyn CollectiveCommunicator> = Arc::new(LocalCommunicator::new_group(1).remove(0));
    let comm: Arc<dyn CollectiveCommunicator> =
        Arc::new(RecordingCommunicator { inner, log: log.clone() });
    let group = ProcessGroup::new(comm, vec![0]);

    let groups = AxisGroups {
        world: group.clone(),
        tensor: group.clone(),
        pipeline: group.clone(),
        data: group,
    };
    let ctx = DistributedContext::new(0, ParallelismConfig::single_device(), Device::Cpu, groups)
        .expect("Failed to build single device context");
    (ctx, log)
}

/// In-process grid, one context per rank.
pub fn grid(world_size: usize, dp: usize, tp: usize, pp: usize) -> Vec<DistributedContext> {
    let config = ParallelismConfig::new(world_size, dp, tp, pp).expect("Invalid parallelism config");
    DistributedContext::local_grid(config, Device::Cpu).expect("Failed to build local grid")
}

/// Drive each context on its own thread and collect the results in rank order.
pub fn run_ranks<T, F>(contexts: Vec<DistributedContext>, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(DistributedContext) -> T + Sync,
{
    std::thread::scope(|s| {
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|ctx| {
                let f = &f;
                s.spawn(move || f(ctx))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

pub fn tensor(values: &[f32]) -> Tensor {
    Tensor::new(values, &Device::Cpu).expect("Failed to create tensor")
}

pub fn values(t: Option<&Tensor>) -> Vec<f32> {
    t.expect("missing gradient")
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .expect("Failed to read tensor")
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-4,
        "expected {}, got {}",
        expected,
        actual
    );
}
