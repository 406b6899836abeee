//! Worker-group collectives: barrier, broadcast, all-reduce, prefix sum,
//! all-gather.
//!
//! Each collective is one barrier-synchronized step. Workers of a host
//! deposit their serialized contribution into a shared scratch area and
//! meet at the host-local thread barrier; local worker 0 (the host leader)
//! performs the inter-host exchange over the transport's flow-control
//! plane, publishing the full `P`-element vector of contributions; a second
//! barrier releases the workers, which each compute their own result from
//! the vector. Folding locally keeps ordered reductions bit-reproducible:
//! every worker folds the same vector in the same rank order.
//!
//! Collectives have no timeouts; a transport failure inside one is fatal.

use crate::common::thread_barrier::ThreadBarrier;
use crate::error::{Error, Result};
use crate::net::transport::Transport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Reduction order for [`FlowControlChannel::all_reduce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOrder {
    /// Strict left-to-right fold over ranks; bit-reproducible even for
    /// operators that are commutative but not associative in floating
    /// point. The default.
    Ordered,
    /// Pairwise tree fold; requires an associative operator.
    Tree,
}

/// Host-level collective state shared by the host's worker threads.
pub struct FlowControlManager {
    transport: Arc<dyn Transport>,
    barrier: ThreadBarrier,
    workers_per_host: usize,
    scratch: Mutex<Vec<Option<Vec<u8>>>>,
    result: Mutex<Arc<Vec<Vec<u8>>>>,
}

impl FlowControlManager {
    pub fn new(transport: Arc<dyn Transport>, workers_per_host: usize) -> Self {
        FlowControlManager {
            transport,
            barrier: ThreadBarrier::new(workers_per_host),
            workers_per_host,
            scratch: Mutex::new(vec![None; workers_per_host]),
            result: Mutex::new(Arc::new(Vec::new())),
        }
    }

    /// One full exchange round: deposit `bytes` for `local_rank`, return
    /// the vector of all `P` workers' contributions in global rank order.
    fn exchange(&self, local_rank: usize, bytes: Vec<u8>) -> Result<Arc<Vec<Vec<u8>>>> {
        self.scratch.lock().unwrap()[local_rank] = Some(bytes);
        self.barrier.wait();

        if local_rank == 0 {
            let host_vec: Vec<Vec<u8>> = {
                let mut scratch = self.scratch.lock().unwrap();
                scratch
                    .iter_mut()
                    .map(|slot| slot.take().expect("every local worker deposited"))
                    .collect()
            };
            let all = self.leader_exchange(host_vec)?;
            *self.result.lock().unwrap() = Arc::new(all);
        }

        self.barrier.wait();
        Ok(Arc::clone(&self.result.lock().unwrap()))
    }

    /// Inter-host step, host leaders only: gather at host 0, broadcast the
    /// assembled vector back.
    fn leader_exchange(&self, host_vec: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let hosts = self.transport.num_hosts();
        let w = self.workers_per_host;
        if self.transport.host_rank() == 0 {
            let mut all: Vec<Vec<u8>> = Vec::with_capacity(hosts * w);
            all.extend(host_vec);
            for h in 1..hosts {
                let blob = self.transport.flow_recv_from(h)?;
                let vec: Vec<Vec<u8>> = postcard::from_bytes(&blob)?;
                if vec.len() != w {
                    return Err(Error::Decode("flow message with wrong arity".into()));
                }
                all.extend(vec);
            }
            let blob = postcard::to_allocvec(&all)?;
            for h in 1..hosts {
                self.transport.flow_send(h, blob.clone())?;
            }
            Ok(all)
        } else {
            let blob = postcard::to_allocvec(&host_vec)?;
            self.transport.flow_send(0, blob)?;
            let blob = self.transport.flow_recv_from(0)?;
            Ok(postcard::from_bytes(&blob)?)
        }
    }
}

/// Per-worker handle for collective operations.
#[derive(Clone)]
pub struct FlowControlChannel {
    manager: Arc<FlowControlManager>,
    local_rank: usize,
    global_rank: usize,
    num_workers: usize,
}

impl FlowControlChannel {
    pub fn new(
        manager: Arc<FlowControlManager>,
        local_rank: usize,
        global_rank: usize,
        num_workers: usize,
    ) -> Self {
        FlowControlChannel {
            manager,
            local_rank,
            global_rank,
            num_workers,
        }
    }

    pub fn global_rank(&self) -> usize {
        self.global_rank
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Return only after every worker of the group has called it.
    pub fn barrier(&self) -> Result<()> {
        self.manager.exchange(self.local_rank, Vec::new())?;
        Ok(())
    }

    /// Every worker returns the `P`-element vector of all contributions.
    pub fn all_gather<T>(&self, value: &T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let bytes = postcard::to_allocvec(value)?;
        let all = self.manager.exchange(self.local_rank, bytes)?;
        all.iter()
            .map(|b| postcard::from_bytes(b).map_err(Error::from))
            .collect()
    }

    /// Every worker returns `root`'s value.
    pub fn broadcast<T>(&self, value: &T, root: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        if root >= self.num_workers {
            return Err(Error::Config(format!("broadcast root {root} out of range")));
        }
        let mut all = self.all_gather(value)?;
        Ok(all.swap_remove(root))
    }

    /// Reduce all workers' values with `op`. [`ReduceOrder::Ordered`] folds
    /// strictly by ascending rank.
    pub fn all_reduce<T>(
        &self,
        value: &T,
        order: ReduceOrder,
        op: impl Fn(T, T) -> T,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let all = self.all_gather(value)?;
        Ok(fold_values(all, order, &op))
    }

    /// Worker `k` returns the fold of `initial` with the contributions of
    /// ranks `0..=k` (inclusive) or `0..k` (exclusive).
    pub fn prefix_sum<T>(
        &self,
        value: &T,
        initial: T,
        inclusive: bool,
        op: impl Fn(T, T) -> T,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let all = self.all_gather(value)?;
        let upto = if inclusive {
            self.global_rank + 1
        } else {
            self.global_rank
        };
        let mut acc = initial;
        for v in all.into_iter().take(upto) {
            acc = op(acc, v);
        }
        Ok(acc)
    }
}

fn fold_values<T>(mut values: Vec<T>, order: ReduceOrder, op: &impl Fn(T, T) -> T) -> T {
    debug_assert!(!values.is_empty());
    match order {
        ReduceOrder::Ordered => {
            let mut it = values.into_iter();
            let first = it.next().expect("non-empty group");
            it.fold(first, |acc, v| op(acc, v))
        }
        ReduceOrder::Tree => {
            while values.len() > 1 {
                let mut next = Vec::with_capacity(values.len().div_ceil(2));
                let mut it = values.into_iter();
                while let Some(a) = it.next() {
                    match it.next() {
                        Some(b) => next.push(op(a, b)),
                        None => next.push(a),
                    }
                }
                values = next;
            }
            values.pop().expect("non-empty group")
        }
    }
}
