//! The per-process block pool and its external-memory swap file.
//!
//! Every byte block of a host lives in its [`BlockPool`]: sealed data blocks
//! of files and queues, inbound shuffle blocks, reduce-table spills. The
//! pool tracks total, resident, pinned and swapped bytes. When an
//! allocation would push resident bytes past the soft limit, the pool picks
//! unpinned resident blocks in LRU order and writes them to a swap file
//! served by a dedicated disk thread; the logical block stays valid and the
//! next pin loads it back. Exceeding the hard limit even after eviction
//! fails the job with [`Error::OutOfMemory`]. Swap-file I/O errors are
//! fatal.

use crate::common::stats::Gauge;
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use super::block::{Block, ByteBlock, BlockState, PinnedBlock};

/// Memory configuration of a block pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Target size of data blocks produced by writers.
    pub block_size: usize,
    /// Soft limit on resident bytes; eviction starts above it.
    pub soft_limit: usize,
    /// Hard limit on resident bytes; exceeding it steady-state is fatal.
    pub hard_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            block_size: 2 * 1024 * 1024,
            soft_limit: 1 << 30,
            hard_limit: usize::MAX,
        }
    }
}

/// Gauges exposed by the pool. At rest `resident + swapped == total` and
/// `pinned <= resident`.
#[derive(Default)]
pub struct PoolStats {
    pub total: Gauge,
    pub resident: Gauge,
    pub pinned: Gauge,
    pub swapped: Gauge,
}

/// Handle to a host's block pool. Cheap to clone.
#[derive(Clone)]
pub struct BlockPool {
    shared: Arc<PoolShared>,
}

impl BlockPool {
    pub fn new(config: PoolConfig) -> Self {
        BlockPool {
            shared: PoolShared::new(config),
        }
    }

    /// Seal `data` into a new unpinned byte block, evicting older blocks
    /// first if the allocation would exceed the soft limit.
    pub fn allocate(&self, data: Vec<u8>) -> Result<Arc<ByteBlock>> {
        self.shared.allocate(data)
    }

    /// Seal `data` into a [`Block`] view covering all of it.
    pub fn allocate_block(
        &self,
        data: Vec<u8>,
        first_item: usize,
        num_items: usize,
    ) -> Result<Block> {
        let len = data.len();
        let bb = self.allocate(data)?;
        Ok(Block::new(bb, 0, len, first_item, num_items))
    }

    pub fn pin(&self, block: &Arc<ByteBlock>) -> Result<PinnedBlock> {
        self.shared.pin(block)
    }

    /// Configured writer block size.
    pub fn block_size(&self) -> usize {
        self.shared.config.block_size
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }
}

/// Shared pool state; block handles keep a `Weak` back-reference to it.
pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) stats: PoolStats,
    inner: Mutex<PoolInner>,
    disk: Sender<DiskRequest>,
    next_id: AtomicU64,
}

struct PoolInner {
    /// Eviction candidates in LRU order. Entries may be stale (pinned again
    /// or dropped); the evictor re-checks before acting.
    lru: VecDeque<u64>,
    index: HashMap<u64, std::sync::Weak<ByteBlock>>,
    /// Free swap-file slots keyed by length.
    swap_free: HashMap<usize, Vec<u64>>,
    swap_end: u64,
}

enum DiskRequest {
    Write {
        offset: u64,
        data: Arc<[u8]>,
        reply: Sender<std::io::Result<()>>,
    },
    Read {
        offset: u64,
        len: usize,
        reply: Sender<std::io::Result<Vec<u8>>>,
    },
}

impl PoolShared {
    fn new(config: PoolConfig) -> Arc<Self> {
        let (tx, rx) = unbounded();
        spawn_disk_thread(rx);
        Arc::new(PoolShared {
            config,
            stats: PoolStats::default(),
            inner: Mutex::new(PoolInner {
                lru: VecDeque::new(),
                index: HashMap::new(),
                swap_free: HashMap::new(),
                swap_end: 0,
            }),
            disk: tx,
            next_id: AtomicU64::new(1),
        })
    }

    fn allocate(self: &Arc<Self>, data: Vec<u8>) -> Result<Arc<ByteBlock>> {
        let len = data.len();
        assert!(len > 0, "empty block allocation");
        self.ensure_capacity(len)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let block = Arc::new(ByteBlock {
            id,
            capacity: len,
            pool: Arc::downgrade(self),
            state: Mutex::new(BlockState {
                data: Some(data.into()),
                pin_count: 0,
                swap_offset: None,
                io_in_flight: false,
            }),
            io_done: std::sync::Condvar::new(),
        });

        let mut inner = self.inner.lock().unwrap();
        inner.index.insert(id, Arc::downgrade(&block));
        inner.lru.push_back(id);
        drop(inner);

        self.stats.total.add(len);
        self.stats.resident.add(len);
        Ok(block)
    }

    /// Evict LRU unpinned blocks until `needed` more resident bytes fit
    /// under the soft limit, or no candidates remain. Then enforce the hard
    /// limit.
    fn ensure_capacity(&self, needed: usize) -> Result<()> {
        while self.stats.resident.get() + needed > self.config.soft_limit {
            let candidate = {
                let mut inner = self.inner.lock().unwrap();
                let mut found = None;
                while let Some(id) = inner.lru.pop_front() {
                    if let Some(block) = inner.index.get(&id).and_then(std::sync::Weak::upgrade) {
                        found = Some(block);
                        break;
                    }
                }
                found
            };
            match candidate {
                Some(block) => self.evict(&block)?,
                None => break,
            }
        }
        if self.stats.resident.get() + needed > self.config.hard_limit {
            return Err(Error::OutOfMemory(format!(
                "cannot allocate {} bytes: {} resident, hard limit {}",
                needed,
                self.stats.resident.get(),
                self.config.hard_limit
            )));
        }
        Ok(())
    }

    /// Write one unpinned resident block out to the swap file.
    fn evict(&self, block: &Arc<ByteBlock>) -> Result<()> {
        let data = {
            let mut state = block.state.lock().unwrap();
            if state.pin_count > 0 || state.io_in_flight || state.data.is_none() {
                return Ok(());
            }
            state.io_in_flight = true;
            Arc::clone(state.data.as_ref().unwrap())
        };

        let offset = self.alloc_swap_slot(data.len());
        trace!(id = block.id, len = data.len(), offset, "evicting block");

        let (reply_tx, reply_rx) = bounded(1);
        let result: std::io::Result<()> = match self.disk.send(DiskRequest::Write {
            offset,
            data: Arc::clone(&data),
            reply: reply_tx,
        }) {
            Ok(()) => reply_rx
                .recv()
                .unwrap_or_else(|_| Err(std::io::Error::other("disk thread gone"))),
            Err(_) => Err(std::io::Error::other("disk thread gone")),
        };

        let mut state = block.state.lock().unwrap();
        state.io_in_flight = false;
        block.io_done.notify_all();
        match result {
            Ok(()) => {
                // Only complete the eviction if nobody pinned meanwhile.
                if state.pin_count == 0 {
                    state.data = None;
                    state.swap_offset = Some(offset);
                    self.stats.resident.sub(block.capacity);
                    self.stats.swapped.add(block.capacity);
                } else {
                    self.free_swap_slot(offset, block.capacity);
                }
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub(crate) fn pin(&self, block: &Arc<ByteBlock>) -> Result<PinnedBlock> {
        loop {
            let mut state = block.state.lock().unwrap();
            if let Some(data) = state.data.clone() {
                state.pin_count += 1;
                if state.pin_count == 1 {
                    self.stats.pinned.add(block.capacity);
                }
                return Ok(PinnedBlock {
                    block: Arc::clone(block),
                    data,
                });
            }
            if state.io_in_flight {
                let _unused = block.io_done.wait(state).unwrap();
                continue;
            }
            // Evicted and idle: load it back ourselves.
            state.io_in_flight = true;
            let offset = state
                .swap_offset
                .ok_or_else(|| Error::Logic("block neither resident nor swapped".into()))?;
            drop(state);

            let loaded = self.load(block, offset);

            let mut state = block.state.lock().unwrap();
            state.io_in_flight = false;
            block.io_done.notify_all();
            let data: Arc<[u8]> = loaded?.into();
            state.data = Some(Arc::clone(&data));
            state.swap_offset = None;
            state.pin_count += 1;
            drop(state);

            self.free_swap_slot(offset, block.capacity);
            self.stats.swapped.sub(block.capacity);
            self.stats.resident.add(block.capacity);
            self.stats.pinned.add(block.capacity);
            debug!(id = block.id, len = block.capacity, "loaded block from swap");
            return Ok(PinnedBlock {
                block: Arc::clone(block),
                data,
            });
        }
    }

    fn load(&self, block: &Arc<ByteBlock>, offset: u64) -> Result<Vec<u8>> {
        self.ensure_capacity(block.capacity)?;
        let (reply_tx, reply_rx) = bounded(1);
        self.disk
            .send(DiskRequest::Read {
                offset,
                len: block.capacity,
                reply: reply_tx,
            })
            .map_err(|_| Error::Logic("disk thread gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Logic("disk thread gone".into()))?
            .map_err(Error::Io)
    }

    pub(crate) fn unpin(&self, block: &Arc<ByteBlock>) {
        let mut state = block.state.lock().unwrap();
        debug_assert!(state.pin_count > 0);
        state.pin_count -= 1;
        if state.pin_count == 0 {
            self.stats.pinned.sub(block.capacity);
            drop(state);
            self.inner.lock().unwrap().lru.push_back(block.id);
        }
    }

    /// Called from `ByteBlock::drop`: return the accounting.
    pub(crate) fn release(&self, block: &ByteBlock) {
        let state = block.state.lock().unwrap();
        if state.data.is_some() {
            self.stats.resident.sub(block.capacity);
            if state.pin_count > 0 {
                self.stats.pinned.sub(block.capacity);
            }
        }
        let swap = state.swap_offset;
        drop(state);
        self.stats.total.sub(block.capacity);
        if let Some(offset) = swap {
            self.stats.swapped.sub(block.capacity);
            self.free_swap_slot(offset, block.capacity);
        }
        self.inner.lock().unwrap().index.remove(&block.id);
    }

    fn alloc_swap_slot(&self, len: usize) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slots) = inner.swap_free.get_mut(&len)
            && let Some(offset) = slots.pop()
        {
            return offset;
        }
        let offset = inner.swap_end;
        inner.swap_end += len as u64;
        offset
    }

    fn free_swap_slot(&self, offset: u64, len: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.swap_free.entry(len).or_default().push(offset);
    }
}

fn spawn_disk_thread(rx: Receiver<DiskRequest>) {
    std::thread::Builder::new()
        .name("pool-disk".into())
        .spawn(move || {
            let mut file: Option<std::fs::File> = None;
            for req in rx {
                if file.is_none() {
                    match tempfile::tempfile() {
                        Ok(f) => file = Some(f),
                        Err(e) => {
                            answer_error(req, e);
                            continue;
                        }
                    }
                }
                let f = file.as_mut().unwrap();
                match req {
                    DiskRequest::Write {
                        offset,
                        data,
                        reply,
                    } => {
                        let r = f
                            .seek(SeekFrom::Start(offset))
                            .and_then(|_| f.write_all(&data));
                        let _ = reply.send(r);
                    }
                    DiskRequest::Read { offset, len, reply } => {
                        let mut buf = vec![0u8; len];
                        let r = f
                            .seek(SeekFrom::Start(offset))
                            .and_then(|_| f.read_exact(&mut buf))
                            .map(|()| buf);
                        let _ = reply.send(r);
                    }
                }
            }
        })
        .expect("spawn pool disk thread");
}

fn answer_error(req: DiskRequest, e: std::io::Error) {
    match req {
        DiskRequest::Write { reply, .. } => {
            let _ = reply.send(Err(e));
        }
        DiskRequest::Read { reply, .. } => {
            let _ = reply.send(Err(e));
        }
    }
}
