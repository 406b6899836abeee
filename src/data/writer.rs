//! Typed block writer: packs serialized items into a sequence of blocks.
//!
//! Items are encoded with `postcard` and length-prefixed with a LEB128
//! varint, then streamed byte-wise into fixed-size buffers. When a buffer
//! fills mid-item the block is sealed and emitted to the sink, and the item
//! continues into the next block; the sealed block records the offset of
//! the first item *starting* inside it and the count of such items, so
//! readers can restart at any block boundary.

use crate::data::pool::BlockPool;
use crate::data::Block;
use crate::error::{Error, Result};
use serde::Serialize;
use std::mem;

/// Anything that can receive sealed blocks from a [`BlockWriter`]: a file,
/// a block queue, or one peer of a stream.
pub trait BlockSink {
    fn append_block(&mut self, block: Block) -> Result<()>;

    /// Close the sink. Called exactly once by [`BlockWriter::close`].
    fn close_sink(&mut self) -> Result<()>;
}

/// Serializes a stream of typed items into blocks emitted to a sink.
pub struct BlockWriter<S: BlockSink> {
    sink: S,
    pool: BlockPool,
    block_size: usize,
    buf: Vec<u8>,
    /// Offset of the first item starting in `buf`, unset while `buf` only
    /// holds the continuation of an item from the previous block.
    first_item: Option<usize>,
    num_items: usize,
    scratch: Vec<u8>,
    items_written: usize,
    closed: bool,
}

impl<S: BlockSink> BlockWriter<S> {
    pub fn new(sink: S, pool: BlockPool) -> Self {
        let block_size = pool.block_size();
        BlockWriter {
            sink,
            pool,
            block_size,
            buf: Vec::new(),
            first_item: None,
            num_items: 0,
            scratch: Vec::new(),
            items_written: 0,
            closed: false,
        }
    }

    /// Override the block size (tests use small blocks to exercise the
    /// boundary handling).
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        assert!(block_size > 0);
        self.block_size = block_size;
        self
    }

    /// Serialize one item into the current block, sealing and emitting
    /// blocks as they fill.
    pub fn put<T: Serialize>(&mut self, item: &T) -> Result<()> {
        if self.closed {
            return Err(Error::Logic("put on closed BlockWriter".into()));
        }
        let scratch = mem::take(&mut self.scratch);
        let scratch = match postcard::to_extend(item, scratch) {
            Ok(s) => s,
            Err(e) => return Err(e.into()),
        };

        // The item starts at the current write position; make sure that
        // position lies inside the block we are about to fill.
        if self.buf.len() == self.block_size {
            self.flush_block()?;
        }
        if self.first_item.is_none() {
            self.first_item = Some(self.buf.len());
        }
        self.num_items += 1;
        self.items_written += 1;

        let mut prefix = [0u8; 10];
        let n = encode_varint(scratch.len() as u64, &mut prefix);
        self.write_bytes(&prefix[..n])?;
        let scratch = {
            self.write_bytes(&scratch)?;
            scratch
        };
        self.scratch = scratch;
        self.scratch.clear();
        Ok(())
    }

    fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let room = self.block_size - self.buf.len();
            if room == 0 {
                self.flush_block()?;
                continue;
            }
            let take = room.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = mem::replace(&mut self.buf, Vec::with_capacity(self.block_size));
        let len = data.len();
        let first_item = self.first_item.take().unwrap_or(len);
        let num_items = mem::take(&mut self.num_items);
        let block = self.pool.allocate_block(data, first_item, num_items)?;
        self.sink.append_block(block)
    }

    /// Emit the final, possibly partial, block and close the sink. Further
    /// `put` calls fail.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_block()?;
        self.closed = true;
        self.sink.close_sink()
    }

    /// Total items written so far.
    pub fn items_written(&self) -> usize {
        self.items_written
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: BlockSink> Drop for BlockWriter<S> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

/// LEB128-encode `v` into `out`, returning the number of bytes used.
pub(crate) fn encode_varint(mut v: u64, out: &mut [u8; 10]) -> usize {
    let mut i = 0;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out[i] = byte;
            return i + 1;
        }
        out[i] = byte | 0x80;
        i += 1;
    }
}
