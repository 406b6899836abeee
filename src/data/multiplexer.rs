//! Per-host router between the byte transport and stream objects.
//!
//! Outbound: workers hand framed block messages to the send loop, which
//! issues transport writes in order. Inbound: the receive loop parses each
//! message's fixed-layout header, wraps the payload in a pool-allocated
//! block and pushes it onto the inbound queue of the addressed
//! `(stream_id, local_worker)` stream for the sending worker. Messages for
//! streams the local workers have not constructed yet are parked and
//! delivered on registration.
//!
//! Wire format per block: the 44-byte native-endian header
//! `{stream_id:u64, payload_size:u64, first_item:u64, num_items:u64,
//! sender_rank:u32, receiver_local_worker:u32, sender_local_worker:u32}`
//! followed by `payload_size` bytes. `payload_size == 0` is the
//! end-of-stream marker for that sender/receiver direction.

use crate::common::stats::TransferStats;
use crate::data::pool::BlockPool;
use crate::data::stream::{StreamKind, StreamTarget};
use crate::data::Block;
use crate::error::{Error, Result};
use crate::net::Transport;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

/// Globally unique stream identifier, allocated in lockstep on all workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Fixed-layout header preceding every block on the wire.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamBlockHeader {
    pub stream_id: u64,
    pub payload_size: u64,
    pub first_item: u64,
    pub num_items: u64,
    pub sender_rank: u32,
    pub receiver_local_worker: u32,
    pub sender_local_worker: u32,
}

pub(crate) const HEADER_BYTES: usize = 4 * 8 + 3 * 4;

impl StreamBlockHeader {
    pub fn is_end(&self) -> bool {
        self.payload_size == 0
    }

    /// Serialize field by field in native byte order.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.stream_id.to_ne_bytes());
        out.extend_from_slice(&self.payload_size.to_ne_bytes());
        out.extend_from_slice(&self.first_item.to_ne_bytes());
        out.extend_from_slice(&self.num_items.to_ne_bytes());
        out.extend_from_slice(&self.sender_rank.to_ne_bytes());
        out.extend_from_slice(&self.receiver_local_worker.to_ne_bytes());
        out.extend_from_slice(&self.sender_local_worker.to_ne_bytes());
    }

    pub fn parse(bytes: &[u8]) -> Result<StreamBlockHeader> {
        if bytes.len() < HEADER_BYTES {
            return Err(Error::Decode("short stream block header".into()));
        }
        let u64_at = |o: usize| u64::from_ne_bytes(bytes[o..o + 8].try_into().unwrap());
        let u32_at = |o: usize| u32::from_ne_bytes(bytes[o..o + 4].try_into().unwrap());
        Ok(StreamBlockHeader {
            stream_id: u64_at(0),
            payload_size: u64_at(8),
            first_item: u64_at(16),
            num_items: u64_at(24),
            sender_rank: u32_at(32),
            receiver_local_worker: u32_at(36),
            sender_local_worker: u32_at(40),
        })
    }
}

enum Parked {
    Block { sender: usize, block: Block },
    End { sender: usize },
}

struct MuxRepo {
    streams: HashMap<(StreamId, usize), StreamTarget>,
    parked: HashMap<(StreamId, usize), Vec<Parked>>,
}

/// The per-host multiplexer.
pub struct Multiplexer {
    transport: Arc<dyn Transport>,
    pool: BlockPool,
    workers_per_host: usize,
    repo: Mutex<MuxRepo>,
    send_tx: Mutex<Option<Sender<(usize, Vec<u8>)>>>,
    send_thread: Mutex<Option<JoinHandle<()>>>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
    stats: TransferStats,
}

impl Multiplexer {
    pub fn new(
        transport: Arc<dyn Transport>,
        pool: BlockPool,
        workers_per_host: usize,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = unbounded();
        let mux = Arc::new(Multiplexer {
            transport,
            pool,
            workers_per_host,
            repo: Mutex::new(MuxRepo {
                streams: HashMap::new(),
                parked: HashMap::new(),
            }),
            send_tx: Mutex::new(Some(send_tx)),
            send_thread: Mutex::new(None),
            recv_thread: Mutex::new(None),
            stats: TransferStats::default(),
        });
        mux.start(send_rx);
        mux
    }

    fn start(self: &Arc<Self>, send_rx: Receiver<(usize, Vec<u8>)>) {
        let transport = Arc::clone(&self.transport);
        let send = std::thread::Builder::new()
            .name("mux-send".into())
            .spawn(move || {
                for (target, bytes) in send_rx {
                    if let Err(e) = transport.send(target, bytes) {
                        error!("multiplexer send failed: {e}");
                        break;
                    }
                }
            })
            .expect("spawn mux send thread");

        let this = Arc::clone(self);
        let recv = std::thread::Builder::new()
            .name("mux-recv".into())
            .spawn(move || loop {
                match this.transport.recv() {
                    Ok(Some(msg)) => {
                        if let Err(e) = this.handle_message(&msg) {
                            error!("multiplexer receive failed: {e}");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("transport receive failed: {e}");
                        break;
                    }
                }
            })
            .expect("spawn mux recv thread");

        *self.send_thread.lock().unwrap() = Some(send);
        *self.recv_thread.lock().unwrap() = Some(recv);
    }

    /// Process-wide transfer counters.
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn workers_per_host(&self) -> usize {
        self.workers_per_host
    }

    pub(crate) fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Enqueue a framed message for the send loop.
    pub(crate) fn post(&self, target_host: usize, bytes: Vec<u8>) -> Result<()> {
        let guard = self.send_tx.lock().unwrap();
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::Logic("multiplexer shut down".into()))?;
        tx.send((target_host, bytes))
            .map_err(|_| Error::Io(std::io::Error::other("send loop gone")))
    }

    /// Look up or construct the stream target for `(id, local_worker)`,
    /// draining any messages that arrived before registration.
    pub(crate) fn get_or_create(
        &self,
        id: StreamId,
        local_worker: usize,
        kind: StreamKind,
        num_workers: usize,
    ) -> Result<StreamTarget> {
        let mut repo = self.repo.lock().unwrap();
        if let Some(existing) = repo.streams.get(&(id, local_worker)) {
            if existing.kind() != kind {
                return Err(Error::Logic(format!(
                    "stream {id:?} opened with conflicting kinds"
                )));
            }
            return Ok(existing.clone());
        }
        let target = StreamTarget::new(kind, num_workers);
        repo.streams.insert((id, local_worker), target.clone());
        if let Some(parked) = repo.parked.remove(&(id, local_worker)) {
            debug!(?id, local_worker, n = parked.len(), "draining parked blocks");
            for msg in parked {
                match msg {
                    Parked::Block { sender, block } => target.on_block(sender, block, true)?,
                    Parked::End { sender } => target.on_end(sender),
                }
            }
        }
        Ok(target)
    }

    /// Receive-loop body: header, then payload, then routing.
    fn handle_message(&self, msg: &[u8]) -> Result<()> {
        let header = StreamBlockHeader::parse(msg)?;
        let key = (
            StreamId(header.stream_id),
            header.receiver_local_worker as usize,
        );
        trace!(?key, size = header.payload_size, "inbound block");

        if header.is_end() {
            self.route(key, Parked::End {
                sender: header.sender_rank as usize,
            })
        } else {
            let payload = &msg[HEADER_BYTES..];
            if payload.len() != header.payload_size as usize {
                return Err(Error::Decode("payload length mismatch".into()));
            }
            self.stats.rx_net_blocks.inc();
            self.stats.rx_net_bytes.add(payload.len());
            self.stats.rx_net_items.add(header.num_items as usize);
            let block = self.pool.allocate_block(
                payload.to_vec(),
                header.first_item as usize,
                header.num_items as usize,
            )?;
            self.route(key, Parked::Block {
                sender: header.sender_rank as usize,
                block,
            })
        }
    }

    fn route(&self, key: (StreamId, usize), msg: Parked) -> Result<()> {
        let mut repo = self.repo.lock().unwrap();
        match repo.streams.get(&key) {
            Some(target) => {
                let target = target.clone();
                drop(repo);
                match msg {
                    Parked::Block { sender, block } => target.on_block(sender, block, true),
                    Parked::End { sender } => {
                        target.on_end(sender);
                        Ok(())
                    }
                }
            }
            None => {
                repo.parked.entry(key).or_default().push(msg);
                Ok(())
            }
        }
    }

    /// Stop accepting outbound messages and drain in-flight writes.
    pub fn finish_sends(&self) {
        self.send_tx.lock().unwrap().take();
        if let Some(h) = self.send_thread.lock().unwrap().take() {
            let _ = h.join();
        }
    }

    /// Close the transport endpoint; the receive loop exits once every
    /// host has done so.
    pub fn shutdown_transport(&self) {
        self.transport.shutdown();
    }

    /// Join the receive loop. Call only after all hosts closed their
    /// transports.
    pub fn join(&self) {
        if let Some(h) = self.recv_thread.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}
