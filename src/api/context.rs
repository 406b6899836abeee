//! Worker contexts and the local job entry point.
//!
//! A job runs on `hosts * workers_per_host` worker threads. Each host owns
//! one [`BlockPool`], one [`Multiplexer`] and one collective manager; each
//! worker thread owns a [`Context`] carrying its identity and per-worker
//! allocation counters for node and stream ids. All workers run the same
//! job function and build identical DAGs, which is what makes the
//! lockstep stream-id allocation deterministic.
//!
//! There is no global state: everything a worker touches hangs off its
//! context, and teardown is controlled by [`run_local_with`].

use crate::core::reduce_table::ReduceConfig;
use crate::data::multiplexer::{Multiplexer, StreamId};
use crate::data::pool::{BlockPool, PoolConfig};
use crate::data::stream::{CatStream, MixStream, StreamSelf};
use crate::error::{Error, Result};
use crate::net::flow::{FlowControlChannel, FlowControlManager};
use crate::net::transport::{build_mesh, Transport};
use crate::common::NodeId;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

/// Engine configuration, applied per host.
#[derive(Clone, Debug)]
pub struct JobConfig {
    pub pool: PoolConfig,
    pub reduce: ReduceConfig,
    /// Memory budget of one external-sort run.
    pub sort_run_bytes: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            pool: PoolConfig::default(),
            reduce: ReduceConfig::default(),
            sort_run_bytes: 64 << 20,
        }
    }
}

/// Per-host shared services.
pub struct HostContext {
    pub(crate) config: JobConfig,
    pub(crate) pool: BlockPool,
    pub(crate) mux: Arc<Multiplexer>,
    pub(crate) flow: Arc<FlowControlManager>,
    host_rank: usize,
    num_hosts: usize,
    workers_per_host: usize,
}

impl HostContext {
    pub fn new(
        config: JobConfig,
        transport: Arc<dyn Transport>,
        workers_per_host: usize,
    ) -> Arc<Self> {
        let pool = BlockPool::new(config.pool.clone());
        let mux = Multiplexer::new(Arc::clone(&transport), pool.clone(), workers_per_host);
        let flow = Arc::new(FlowControlManager::new(
            Arc::clone(&transport),
            workers_per_host,
        ));
        Arc::new(HostContext {
            config,
            pool,
            mux,
            flow,
            host_rank: transport.host_rank(),
            num_hosts: transport.num_hosts(),
            workers_per_host,
        })
    }
}

struct ContextInner {
    host: Arc<HostContext>,
    local_rank: usize,
    global_rank: usize,
    next_node_id: Cell<u64>,
    next_stream_id: Cell<u64>,
}

/// A worker's view of the engine: identity, collectives, memory, shuffle
/// construction. Cheap to clone; every `Dia` holds one.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    pub(crate) fn new(host: Arc<HostContext>, local_rank: usize) -> Self {
        let global_rank = host.host_rank * host.workers_per_host + local_rank;
        Context {
            inner: Rc::new(ContextInner {
                host,
                local_rank,
                global_rank,
                next_node_id: Cell::new(0),
                next_stream_id: Cell::new(0),
            }),
        }
    }

    /// Dense global worker rank in `[0, num_workers)`.
    pub fn global_rank(&self) -> usize {
        self.inner.global_rank
    }

    /// Worker rank within this host.
    pub fn local_rank(&self) -> usize {
        self.inner.local_rank
    }

    pub fn host_rank(&self) -> usize {
        self.inner.host.host_rank
    }

    pub fn num_hosts(&self) -> usize {
        self.inner.host.num_hosts
    }

    pub fn workers_per_host(&self) -> usize {
        self.inner.host.workers_per_host
    }

    /// Total workers in the group.
    pub fn num_workers(&self) -> usize {
        self.inner.host.num_hosts * self.inner.host.workers_per_host
    }

    /// Collective primitives over the whole worker group.
    pub fn flow(&self) -> FlowControlChannel {
        FlowControlChannel::new(
            Arc::clone(&self.inner.host.flow),
            self.inner.local_rank,
            self.inner.global_rank,
            self.num_workers(),
        )
    }

    /// This host's block pool.
    pub fn pool(&self) -> &BlockPool {
        &self.inner.host.pool
    }

    pub fn config(&self) -> &JobConfig {
        &self.inner.host.config
    }

    /// Process-wide shuffle statistics of this host.
    pub fn net_stats(&self) -> &crate::common::stats::TransferStats {
        self.inner.host.mux.stats()
    }

    pub(crate) fn new_node_id(&self) -> NodeId {
        let id = self.inner.next_node_id.get();
        self.inner.next_node_id.set(id + 1);
        NodeId::new(id)
    }

    fn next_stream_id(&self) -> StreamId {
        let id = self.inner.next_stream_id.get();
        self.inner.next_stream_id.set(id + 1);
        StreamId(id)
    }

    fn stream_self(&self) -> StreamSelf {
        StreamSelf {
            global_rank: self.inner.global_rank,
            local_rank: self.inner.local_rank,
            host_rank: self.inner.host.host_rank,
            workers_per_host: self.inner.host.workers_per_host,
            num_workers: self.num_workers(),
        }
    }

    /// Allocate the next shuffle stream with deterministic ordering
    /// (concatenated in sender-rank order).
    pub fn new_cat_stream(&self) -> Result<CatStream> {
        let id = self.next_stream_id();
        CatStream::new(id, Arc::clone(&self.inner.host.mux), self.stream_self())
    }

    /// Allocate the next shuffle stream with arrival ordering.
    pub fn new_mix_stream(&self) -> Result<MixStream> {
        let id = self.next_stream_id();
        MixStream::new(id, Arc::clone(&self.inner.host.mux), self.stream_self())
    }
}

/// Run `job` on an in-process group of `hosts * workers_per_host` workers
/// with default configuration.
pub fn run_local<F>(hosts: usize, workers_per_host: usize, job: F) -> Result<()>
where
    F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
{
    run_local_with(JobConfig::default(), hosts, workers_per_host, job)
}

/// Run `job` on one host with one worker per available core.
pub fn run_local_auto<F>(job: F) -> Result<()>
where
    F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
{
    run_local(1, num_cpus::get().max(2), job)
}

/// Run `job` on an in-process worker group. Every worker executes the same
/// function; the first error any worker reports becomes the job outcome.
pub fn run_local_with<F>(
    config: JobConfig,
    hosts: usize,
    workers_per_host: usize,
    job: F,
) -> Result<()>
where
    F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
{
    if hosts == 0 || workers_per_host == 0 {
        return Err(Error::Config(
            "hosts and workers_per_host must be positive".into(),
        ));
    }
    debug!(hosts, workers_per_host, "starting local job");

    let transports = build_mesh(hosts);
    let host_ctxs: Vec<Arc<HostContext>> = transports
        .iter()
        .map(|t| {
            HostContext::new(
                config.clone(),
                Arc::clone(t) as Arc<dyn Transport>,
                workers_per_host,
            )
        })
        .collect();

    let job = Arc::new(job);
    let mut handles = Vec::new();
    for (h, host_ctx) in host_ctxs.iter().enumerate() {
        for w in 0..workers_per_host {
            let host_ctx = Arc::clone(host_ctx);
            let job = Arc::clone(&job);
            let rank = h * workers_per_host + w;
            let handle = std::thread::Builder::new()
                .name(format!("worker-{rank}"))
                .spawn(move || {
                    let mut ctx = Context::new(host_ctx, w);
                    job(&mut ctx)
                })?;
            handles.push((rank, handle));
        }
    }

    let mut first_err: Option<Error> = None;
    for (rank, handle) in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(match e {
                        already @ Error::Worker { .. } => already,
                        other => Error::Worker {
                            rank,
                            operator: "job".into(),
                            source: Box::new(other),
                        },
                    });
                }
            }
            Err(_) => {
                if first_err.is_none() {
                    first_err = Some(Error::User(format!("worker {rank} panicked")));
                }
            }
        }
    }

    // Teardown: drain sends everywhere, then close all transports, then
    // join the receive loops.
    for hc in &host_ctxs {
        hc.mux.finish_sends();
    }
    for hc in &host_ctxs {
        hc.mux.shutdown_transport();
    }
    for hc in &host_ctxs {
        hc.mux.join();
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
