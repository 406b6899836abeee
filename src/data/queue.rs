//! Single-producer/single-consumer block queue with close notification.
//!
//! The producer pushes sealed blocks and finally a terminator (`close`).
//! A bounded queue exerts backpressure: `push` suspends the producer while
//! the pipe is at capacity. The reader picks its mode at construction:
//! *consume* drains the pipe, bounding the footprint by the pipe capacity;
//! *keep* additionally copies every block into an internal file so the data
//! can be re-read after the queue closes.

use crate::data::file::{File, KeepFileSource};
use crate::data::reader::{BlockReader, BlockSource};
use crate::data::writer::{BlockSink, BlockWriter};
use crate::data::Block;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Shared SPSC block pipe. Cheap to clone; producer and consumer hold
/// clones of the same queue.
#[derive(Clone)]
pub struct BlockQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct QueueState {
    deque: VecDeque<Block>,
    write_closed: bool,
    /// Set once a reader has fully drained the pipe.
    read_closed: bool,
    /// Blocks copied aside by a keep-reader, re-readable after close.
    cache: File,
}

impl BlockQueue {
    /// A queue whose pipe holds at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        BlockQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    deque: VecDeque::new(),
                    write_closed: false,
                    read_closed: false,
                    cache: File::new(),
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
        }
    }

    /// A queue without backpressure, used for stream inbound sides where
    /// blocking the network receive loop could deadlock the shuffle.
    pub fn unbounded() -> Self {
        BlockQueue::new(usize::MAX)
    }

    /// Append a block, suspending while the pipe is full.
    pub fn push(&self, block: Block) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.write_closed {
            return Err(Error::Logic("push on closed BlockQueue".into()));
        }
        while state.deque.len() >= self.inner.capacity {
            state = self.inner.not_full.wait(state).unwrap();
        }
        state.deque.push_back(block);
        drop(state);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Deliver the terminator: the reader observes end-of-data once the
    /// pipe drains.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.write_closed = true;
        drop(state);
        self.inner.not_empty.notify_all();
    }

    pub fn is_write_closed(&self) -> bool {
        self.inner.state.lock().unwrap().write_closed
    }

    /// Number of blocks currently in the pipe.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a writer whose sealed blocks are pushed into this queue.
    pub fn writer(&self, pool: &crate::data::BlockPool) -> BlockWriter<QueueSink> {
        BlockWriter::new(QueueSink { queue: self.clone() }, pool.clone())
    }

    /// Open the reader. `consume=true` drains the pipe; `consume=false`
    /// also caches blocks into an internal file, and readers opened after
    /// the queue was drained serve from that cache.
    pub fn reader(&self, consume: bool) -> BlockReader<QueueSource> {
        let state = self.inner.state.lock().unwrap();
        let mode = if state.read_closed {
            // Already drained once; replay from the keep-cache.
            Mode::Cached(KeepFileSource::from_file(&state.cache))
        } else if consume {
            Mode::Live { keep: false }
        } else {
            Mode::Live { keep: true }
        };
        drop(state);
        BlockReader::new(QueueSource {
            queue: self.clone(),
            mode,
        })
    }

    /// Raw consuming source, used by stream readers that interleave
    /// several queues.
    pub(crate) fn consume_source(&self) -> QueueSource {
        QueueSource {
            queue: self.clone(),
            mode: Mode::Live { keep: false },
        }
    }

    /// Pop the next block, waiting for the producer; `None` after the
    /// terminator.
    fn pop_wait(&self) -> Option<Block> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(block) = state.deque.pop_front() {
                drop(state);
                self.inner.not_full.notify_one();
                return Some(block);
            }
            if state.write_closed {
                state.read_closed = true;
                return None;
            }
            state = self.inner.not_empty.wait(state).unwrap();
        }
    }

    fn cache_block(&self, block: Block) -> Result<()> {
        self.inner.state.lock().unwrap().cache.append_block(block)
    }
}

enum Mode {
    Live { keep: bool },
    Cached(KeepFileSource),
}

/// Block source draining a [`BlockQueue`].
pub struct QueueSource {
    queue: BlockQueue,
    mode: Mode,
}

impl BlockSource for QueueSource {
    fn next_block(&mut self) -> Result<Option<Block>> {
        match &mut self.mode {
            Mode::Live { keep } => match self.queue.pop_wait() {
                Some(block) => {
                    if *keep {
                        self.queue.cache_block(block.clone())?;
                    }
                    Ok(Some(block))
                }
                None => Ok(None),
            },
            Mode::Cached(source) => source.next_block(),
        }
    }
}

/// Block sink pushing into a [`BlockQueue`].
pub struct QueueSink {
    queue: BlockQueue,
}

impl BlockSink for QueueSink {
    fn append_block(&mut self, block: Block) -> Result<()> {
        self.queue.push(block)
    }

    fn close_sink(&mut self) -> Result<()> {
        self.queue.close();
        Ok(())
    }
}
