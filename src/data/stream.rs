//! All-to-all shuffle streams.
//!
//! A stream is a worker-level shuffle endpoint identified by
//! `(stream_id, local_worker)`. Each worker opens one block writer per
//! global peer; items written to peer `p` appear at `p`'s reader on `p`'s
//! host. Two flavors: [`CatStream`] readers concatenate inbound queues in
//! peer-rank order (deterministic), [`MixStream`] readers interleave blocks
//! in arrival order. Writers whose destination lives on the same host
//! short-circuit into the receiver's inbound queue without touching the
//! transport; those transfers are counted as `int_*` in the stream's
//! statistics, network transfers as `net_*`.

use crate::common::stats::TransferStats;
use crate::data::multiplexer::{Multiplexer, StreamBlockHeader, StreamId, HEADER_BYTES};
use crate::data::queue::{BlockQueue, QueueSource};
use crate::data::reader::{BlockReader, BlockSource};
use crate::data::writer::{BlockSink, BlockWriter};
use crate::data::Block;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Stream flavor, fixed at creation on every worker alike.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Cat,
    Mix,
}

/// Receiving-side state of a stream endpoint, registered with the host's
/// multiplexer.
#[derive(Clone)]
pub(crate) enum StreamTarget {
    Cat(Arc<CatStreamData>),
    Mix(Arc<MixStreamData>),
}

impl StreamTarget {
    pub(crate) fn new(kind: StreamKind, num_workers: usize) -> StreamTarget {
        match kind {
            StreamKind::Cat => StreamTarget::Cat(Arc::new(CatStreamData::new(num_workers))),
            StreamKind::Mix => StreamTarget::Mix(Arc::new(MixStreamData::new(num_workers))),
        }
    }

    pub(crate) fn kind(&self) -> StreamKind {
        match self {
            StreamTarget::Cat(_) => StreamKind::Cat,
            StreamTarget::Mix(_) => StreamKind::Mix,
        }
    }

    pub(crate) fn on_block(&self, sender: usize, block: Block, net: bool) -> Result<()> {
        let stats = self.stats();
        if net {
            stats.rx_net_blocks.inc();
            stats.rx_net_bytes.add(block.size());
            stats.rx_net_items.add(block.num_items());
        } else {
            stats.rx_int_blocks.inc();
            stats.rx_int_bytes.add(block.size());
            stats.rx_int_items.add(block.num_items());
        }
        match self {
            StreamTarget::Cat(data) => data.queues[sender].push(block),
            StreamTarget::Mix(data) => {
                data.push(MixEvent::Block(block));
                Ok(())
            }
        }
    }

    pub(crate) fn on_end(&self, sender: usize) {
        match self {
            StreamTarget::Cat(data) => data.queues[sender].close(),
            StreamTarget::Mix(data) => data.push(MixEvent::End),
        }
    }

    pub(crate) fn stats(&self) -> &Arc<TransferStats> {
        match self {
            StreamTarget::Cat(data) => &data.stats,
            StreamTarget::Mix(data) => &data.stats,
        }
    }
}

/// Inbound state of a cat stream: one queue per global sender, read in
/// sender-rank order.
pub(crate) struct CatStreamData {
    queues: Vec<BlockQueue>,
    stats: Arc<TransferStats>,
}

impl CatStreamData {
    fn new(num_workers: usize) -> Self {
        CatStreamData {
            queues: (0..num_workers).map(|_| BlockQueue::unbounded()).collect(),
            stats: Arc::new(TransferStats::default()),
        }
    }
}

enum MixEvent {
    Block(Block),
    End,
}

/// Inbound state of a mix stream: a single arrival-ordered queue plus the
/// count of senders that have not yet signalled end-of-stream.
pub(crate) struct MixStreamData {
    state: Mutex<MixState>,
    not_empty: Condvar,
    stats: Arc<TransferStats>,
}

struct MixState {
    events: VecDeque<Block>,
    senders_remaining: usize,
}

impl MixStreamData {
    fn new(num_workers: usize) -> Self {
        MixStreamData {
            state: Mutex::new(MixState {
                events: VecDeque::new(),
                senders_remaining: num_workers,
            }),
            not_empty: Condvar::new(),
            stats: Arc::new(TransferStats::default()),
        }
    }

    fn push(&self, ev: MixEvent) {
        let mut state = self.state.lock().unwrap();
        match ev {
            MixEvent::Block(b) => state.events.push_back(b),
            MixEvent::End => {
                debug_assert!(state.senders_remaining > 0);
                state.senders_remaining -= 1;
            }
        }
        drop(state);
        self.not_empty.notify_all();
    }

    fn pop_wait(&self) -> Option<Block> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(block) = state.events.pop_front() {
                return Some(block);
            }
            if state.senders_remaining == 0 {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }
}

/// Identity of the worker operating a stream endpoint.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamSelf {
    pub global_rank: usize,
    pub local_rank: usize,
    pub host_rank: usize,
    pub workers_per_host: usize,
    pub num_workers: usize,
}

/// Deterministic-order shuffle stream.
pub struct CatStream {
    id: StreamId,
    data: Arc<CatStreamData>,
    mux: Arc<Multiplexer>,
    me: StreamSelf,
}

impl CatStream {
    pub(crate) fn new(id: StreamId, mux: Arc<Multiplexer>, me: StreamSelf) -> Result<Self> {
        let target = mux.get_or_create(id, me.local_rank, StreamKind::Cat, me.num_workers)?;
        let StreamTarget::Cat(data) = target else {
            unreachable!("kind checked by get_or_create")
        };
        Ok(CatStream { id, data, mux, me })
    }

    /// One block writer per global peer, in peer-rank order. Closing a
    /// writer sends that peer its end-of-stream marker.
    pub fn open_writers(&self) -> Result<Vec<BlockWriter<StreamSink>>> {
        open_writers(self.id, StreamKind::Cat, &self.mux, self.me, &self.data.stats)
    }

    /// Reader concatenating the inbound queues in sender-rank order.
    pub fn reader(&self) -> BlockReader<CatStreamSource> {
        BlockReader::new(CatStreamSource {
            sources: self
                .data
                .queues
                .iter()
                .map(|q| q.consume_source())
                .collect(),
            current: 0,
        })
    }

    /// One consuming reader per sender, in sender-rank order. Used by
    /// operators that merge per-sender sorted sequences.
    pub fn per_sender_readers(&self) -> Vec<BlockReader<QueueSource>> {
        self.data
            .queues
            .iter()
            .map(|q| BlockReader::new(q.consume_source()))
            .collect()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.data.stats
    }
}

/// Arrival-order shuffle stream.
pub struct MixStream {
    id: StreamId,
    data: Arc<MixStreamData>,
    mux: Arc<Multiplexer>,
    me: StreamSelf,
}

impl MixStream {
    pub(crate) fn new(id: StreamId, mux: Arc<Multiplexer>, me: StreamSelf) -> Result<Self> {
        let target = mux.get_or_create(id, me.local_rank, StreamKind::Mix, me.num_workers)?;
        let StreamTarget::Mix(data) = target else {
            unreachable!("kind checked by get_or_create")
        };
        Ok(MixStream { id, data, mux, me })
    }

    pub fn open_writers(&self) -> Result<Vec<BlockWriter<StreamSink>>> {
        open_writers(self.id, StreamKind::Mix, &self.mux, self.me, &self.data.stats)
    }

    /// Reader over blocks in arrival order, ending once every sender has
    /// signalled end-of-stream.
    pub fn reader(&self) -> BlockReader<MixStreamSource> {
        BlockReader::new(MixStreamSource {
            data: Arc::clone(&self.data),
        })
    }

    pub fn stats(&self) -> &TransferStats {
        &self.data.stats
    }
}

fn open_writers(
    id: StreamId,
    kind: StreamKind,
    mux: &Arc<Multiplexer>,
    me: StreamSelf,
    tx_stats: &Arc<TransferStats>,
) -> Result<Vec<BlockWriter<StreamSink>>> {
    (0..me.num_workers)
        .map(|peer| {
            let sink = StreamSink {
                id,
                kind,
                mux: Arc::clone(mux),
                me,
                target_host: peer / me.workers_per_host,
                target_local: peer % me.workers_per_host,
                tx_stats: Arc::clone(tx_stats),
                closed: false,
            };
            Ok(BlockWriter::new(sink, mux.pool().clone()))
        })
        .collect()
}

/// Block sink shipping to one peer of a stream.
pub struct StreamSink {
    id: StreamId,
    kind: StreamKind,
    mux: Arc<Multiplexer>,
    me: StreamSelf,
    target_host: usize,
    target_local: usize,
    tx_stats: Arc<TransferStats>,
    closed: bool,
}

impl StreamSink {
    fn same_host(&self) -> bool {
        self.target_host == self.me.host_rank
    }

    fn header(&self, block: Option<&Block>) -> StreamBlockHeader {
        StreamBlockHeader {
            stream_id: self.id.0,
            payload_size: block.map_or(0, |b| b.size() as u64),
            first_item: block.map_or(0, |b| b.first_item() as u64),
            num_items: block.map_or(0, |b| b.num_items() as u64),
            sender_rank: self.me.global_rank as u32,
            receiver_local_worker: self.target_local as u32,
            sender_local_worker: self.me.local_rank as u32,
        }
    }
}

impl BlockSink for StreamSink {
    fn append_block(&mut self, block: Block) -> Result<()> {
        if self.same_host() {
            // Loopback: hand the block to the receiver's queue directly.
            self.tx_stats.tx_int_blocks.inc();
            self.tx_stats.tx_int_bytes.add(block.size());
            self.tx_stats.tx_int_items.add(block.num_items());
            let target = self.mux.get_or_create(
                self.id,
                self.target_local,
                self.kind,
                self.me.num_workers,
            )?;
            target.on_block(self.me.global_rank, block, false)
        } else {
            self.tx_stats.tx_net_blocks.inc();
            self.tx_stats.tx_net_bytes.add(block.size());
            self.tx_stats.tx_net_items.add(block.num_items());
            let pinned = block.pin()?;
            let mut msg = Vec::with_capacity(HEADER_BYTES + block.size());
            self.header(Some(&block)).write_to(&mut msg);
            msg.extend_from_slice(&pinned.data()[block.begin()..block.end()]);
            self.mux.post(self.target_host, msg)
        }
    }

    fn close_sink(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.same_host() {
            let target = self.mux.get_or_create(
                self.id,
                self.target_local,
                self.kind,
                self.me.num_workers,
            )?;
            target.on_end(self.me.global_rank);
            Ok(())
        } else {
            let mut msg = Vec::with_capacity(HEADER_BYTES);
            self.header(None).write_to(&mut msg);
            self.mux.post(self.target_host, msg)
        }
    }
}

/// Reader source concatenating per-sender queues in rank order.
pub struct CatStreamSource {
    sources: Vec<QueueSource>,
    current: usize,
}

impl BlockSource for CatStreamSource {
    fn next_block(&mut self) -> Result<Option<Block>> {
        while self.current < self.sources.len() {
            match self.sources[self.current].next_block()? {
                Some(block) => return Ok(Some(block)),
                None => self.current += 1,
            }
        }
        Ok(None)
    }
}

/// Reader source yielding blocks in arrival order.
pub struct MixStreamSource {
    data: Arc<MixStreamData>,
}

impl BlockSource for MixStreamSource {
    fn next_block(&mut self) -> Result<Option<Block>> {
        Ok(self.data.pop_wait())
    }
}
