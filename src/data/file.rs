//! A `File`: an ordered, persisted sequence of blocks.
//!
//! Files are append-only while a writer is open and immutable afterwards.
//! Any number of keep-readers may iterate concurrently; a consume-reader is
//! exclusive and releases each block back to the pool as it finishes it.
//! Per-block cumulative item counts allow seeking a reader to any item
//! index.

use crate::data::pool::BlockPool;
use crate::data::reader::{BlockReader, BlockSource};
use crate::data::writer::{BlockSink, BlockWriter};
use crate::data::Block;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Shared handle to a block file. Cheap to clone; all clones view the same
/// storage.
#[derive(Clone, Default)]
pub struct File {
    inner: Arc<Mutex<FileState>>,
}

#[derive(Default)]
struct FileState {
    blocks: Vec<Block>,
    /// Cumulative item count *after* each block.
    items_cum: Vec<usize>,
    num_items: usize,
    size_bytes: usize,
    closed: bool,
}

impl File {
    pub fn new() -> Self {
        File::default()
    }

    /// Open the single writer. The file stays append-only until the writer
    /// closes.
    pub fn writer(&self, pool: &BlockPool) -> BlockWriter<FileSink> {
        BlockWriter::new(
            FileSink {
                file: self.clone(),
                close_file: true,
            },
            pool.clone(),
        )
    }

    /// A writer that appends without sealing the file on close, so another
    /// writer may append later. Used by spill files that grow in rounds.
    pub fn appending_writer(&self, pool: &BlockPool) -> BlockWriter<FileSink> {
        BlockWriter::new(
            FileSink {
                file: self.clone(),
                close_file: false,
            },
            pool.clone(),
        )
    }

    pub(crate) fn append_block(&self, block: Block) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.closed {
            return Err(Error::Logic("append to closed File".into()));
        }
        state.num_items += block.num_items();
        state.size_bytes += block.size();
        let cum = state.num_items;
        state.items_cum.push(cum);
        state.blocks.push(block);
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }

    pub fn num_items(&self) -> usize {
        self.inner.lock().unwrap().num_items
    }

    pub fn num_blocks(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().unwrap().size_bytes
    }

    /// Non-consuming reader over a snapshot of the current blocks.
    pub fn reader(&self) -> BlockReader<KeepFileSource> {
        let state = self.inner.lock().unwrap();
        BlockReader::new(KeepFileSource {
            blocks: state.blocks.clone().into(),
        })
    }

    /// Exclusive consuming reader: takes the blocks out of the file and
    /// releases each one as it is fully read.
    pub fn consume_reader(&self) -> BlockReader<ConsumeFileSource> {
        let mut state = self.inner.lock().unwrap();
        let blocks = std::mem::take(&mut state.blocks).into();
        state.items_cum.clear();
        state.num_items = 0;
        state.size_bytes = 0;
        BlockReader::new(ConsumeFileSource { blocks })
    }

    /// Reader over either a consuming or a non-consuming source, chosen at
    /// runtime, boxed so both arms share a single type.
    pub fn reader_dyn(&self, consume: bool) -> BlockReader<Box<dyn BlockSource>> {
        if consume {
            BlockReader::new(Box::new(self.consume_reader().into_source()))
        } else {
            BlockReader::new(Box::new(self.reader().into_source()))
        }
    }

    /// Reader positioned at item `index` (0-based), using the per-block
    /// cumulative item counts for the seek.
    pub fn reader_at(&self, index: usize) -> Result<BlockReader<KeepFileSource>> {
        let state = self.inner.lock().unwrap();
        if index >= state.num_items {
            return Err(Error::Logic(format!(
                "reader_at({index}) beyond {} items",
                state.num_items
            )));
        }
        // First block whose cumulative count exceeds `index`: the item
        // starts there.
        let block_idx = state.items_cum.partition_point(|&c| c <= index);
        let items_before = if block_idx == 0 {
            0
        } else {
            state.items_cum[block_idx - 1]
        };
        let mut blocks: VecDeque<Block> = state.blocks[block_idx..].iter().cloned().collect();
        drop(state);
        if let Some(first) = blocks.front_mut() {
            *first = first.trim_to_first_item();
        }
        let mut reader = BlockReader::new(KeepFileSource { blocks });
        for _ in items_before..index {
            reader.skip_item()?;
        }
        Ok(reader)
    }

    /// Release all storage.
    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap();
        state.blocks.clear();
        state.items_cum.clear();
        state.num_items = 0;
        state.size_bytes = 0;
    }

    /// Read every item into a vector (non-consuming convenience).
    pub fn collect_vec<T: serde::de::DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.reader().collect_vec()
    }
}

/// Block sink appending to a [`File`].
pub struct FileSink {
    file: File,
    close_file: bool,
}

impl BlockSink for FileSink {
    fn append_block(&mut self, block: Block) -> Result<()> {
        self.file.append_block(block)
    }

    fn close_sink(&mut self) -> Result<()> {
        if self.close_file {
            self.file.close();
        }
        Ok(())
    }
}

/// Snapshot source leaving the file intact.
pub struct KeepFileSource {
    blocks: VecDeque<Block>,
}

impl KeepFileSource {
    pub(crate) fn from_file(file: &File) -> Self {
        let state = file.inner.lock().unwrap();
        KeepFileSource {
            blocks: state.blocks.clone().into(),
        }
    }
}

impl BlockSource for KeepFileSource {
    fn next_block(&mut self) -> Result<Option<Block>> {
        Ok(self.blocks.pop_front())
    }
}

/// Source that owns the file's blocks and drops each after handing it out.
pub struct ConsumeFileSource {
    blocks: VecDeque<Block>,
}

impl BlockSource for ConsumeFileSource {
    fn next_block(&mut self) -> Result<Option<Block>> {
        Ok(self.blocks.pop_front())
    }
}
