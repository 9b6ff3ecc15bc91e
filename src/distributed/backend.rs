use super::{CollectiveCommunicator, ReduceOp};
use candle_core::{Result, Tensor};
use std::sync::{Arc, Barrier, Mutex, PoisonError};

struct SharedState {
    buffers: Mutex<Vec<Option<Vec<Tensor>>>>,
    barrier: Barrier,
}

/// In-process communicator: every rank is a thread sharing one buffer table.
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalCommunicator {
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedState {
            buffers: Mutex::new((0..world_size).map(|_| None).collect()),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn reduce_buffers(&self, len: usize, op: ReduceOp) -> Result<Vec<Tensor>> {
        let buffers = self.shared.buffers.lock().map_err(poisoned)?;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let mut acc: Option<Tensor> = None;
            for (peer, slot) in buffers.iter().enumerate() {
                let peer_tensors = slot.as_ref().ok_or_else(|| {
                    candle_core::Error::Msg(format!("rank {} posted no buffer", peer))
                })?;
                if peer_tensors.len() != len {
                    return Err(candle_core::Error::Msg(format!(
                        "collective mismatch: rank {} reduced {} tensors, rank {} reduced {}",
                        self.rank,
                        len,
                        peer,
                        peer_tensors.len()
                    )));
                }
                let t = &peer_tensors[i];
                acc = Some(match acc {
                    None => t.clone(),
                    Some(a) => match op {
                        ReduceOp::Sum => a.add(t)?,
                        ReduceOp::Max => a.maximum(t)?,
                    },
                });
            }
            out.push(acc.ok_or_else(|| candle_core::Error::Msg("empty group".to_string()))?);
        }
        Ok(out)
    }
}

fn poisoned<T>(e: PoisonError<T>) -> candle_core::Error {
    candle_core::Error::Msg(format!("local communicator lock poisoned: {}", e))
}

impl CollectiveCommunicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_coalesced(&self, tensors: &[Tensor], op: ReduceOp) -> Result<Vec<Tensor>> {
        if self.world_size == 1 {
            return Ok(tensors.to_vec());
        }

        // 1. Post
        let posted = self
            .shared
            .buffers
            .lock()
            .map(|mut buffers| buffers[self.rank] = Some(tensors.to_vec()))
            .map_err(poisoned);

        // 2. Wait for all, even if posting failed, so peers are not left waiting
        self.shared.barrier.wait();

        // 3. Everyone reduces its own copy
        let reduced = posted.and_then(|()| self.reduce_buffers(tensors.len(), op));

        // 4. Nobody may clear its slot until all have read
        self.shared.barrier.wait();
        if let Ok(mut buffers) = self.shared.buffers.lock() {
            buffers[self.rank] = None;
        }

        reduced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    #[test]
    fn test_all_reduce() -> Result<()> {
        let world_size = 4;
        let comms = LocalCommunicator::new_group(world_size);

        let handles: Vec<_> = comms.into_iter().map(|comm| {
            thread::spawn(move || {
                let device = Device::Cpu;
                let t = Tensor::new(&[1.0f32], &device).unwrap();
                let res = comm.all_reduce(&t, ReduceOp::Sum).unwrap();
                res.get(0).unwrap().to_scalar::<f32>().unwrap()
            })
        }).collect();

        for h in handles {
            let val = h.join().unwrap();
            assert_eq!(val, 4.0);
        }
        Ok(())
    }

    #[test]
    fn test_all_reduce_max() {
        let comms = LocalCommunicator::new_group(3);

        let handles: Vec<_> = comms.into_iter().map(|comm| {
            thread::spawn(move || {
                let v = comm.rank() as f32 * 2.0 - 1.0;
                let t = Tensor::new(&[v, -v], &Device::Cpu).unwrap();
                comm.all_reduce(&t, ReduceOp::Max).unwrap().to_vec1::<f32>().unwrap()
            })
        }).collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), vec![3.0, 1.0]);
        }
    }

    #[test]
    fn test_coalesced_keeps_positions() {
        let comms = LocalCommunicator::new_group(2);

        let handles: Vec<_> = comms.into_iter().map(|comm| {
            thread::spawn(move || {
                let r = comm.rank() as f32;
                let a = Tensor::new(&[r], &Device::Cpu).unwrap();
                let b = Tensor::new(&[10.0 + r, 20.0 + r], &Device::Cpu).unwrap();
                let out = comm.all_reduce_coalesced(&[a, b], ReduceOp::Sum).unwrap();
                (out[0].to_vec1::<f32>().unwrap(), out[1].to_vec1::<f32>().unwrap())
            })
        }).collect();

        for h in handles {
            let (a, b) = h.join().unwrap();
            assert_eq!(a, vec![1.0]);
            assert_eq!(b, vec![21.0, 41.0]);
        }
    }

    #[test]
    fn test_mismatched_lengths_error_on_every_rank() {
        let comms = LocalCommunicator::new_group(2);

        let handles: Vec<_> = comms.into_iter().map(|comm| {
            thread::spawn(move || {
                let t = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
                let list = if comm.rank() == 0 { vec![t.clone()] } else { vec![t.clone(), t] };
                comm.all_reduce_coalesced(&list, ReduceOp::Sum).is_err()
            })
        }).collect();

        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn test_single_rank_passthrough() -> Result<()> {
        let comm = LocalCommunicator::new_group(1).pop().unwrap();
        let t = Tensor::new(&[2.5f32, -1.0], &Device::Cpu)?;
        let out = comm.all_reduce_pinned(&[t], ReduceOp::Max)?;
        assert_eq!(out[0].to_vec1::<f32>()?, vec![2.5, -1.0]);
        Ok(())
    }

    #[test]
    fn test_poisoned_buffers_error_without_hanging() {
        let comms = LocalCommunicator::new_group(2);

        let shared = comms[0].shared.clone();
        let _ = thread::spawn(move || {
            let _guard = shared.buffers.lock().unwrap();
            panic!("poison the buffer table");
        })
        .join();

        let handles: Vec<_> = comms.into_iter().map(|comm| {
            thread::spawn(move || {
                let t = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
                comm.all_reduce(&t, ReduceOp::Sum).is_err()
            })
        }).collect();

        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
