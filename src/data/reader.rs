//! Typed block reader: unpacks items from a sequence of blocks.
//!
//! The reader pulls blocks from a [`BlockSource`] (a file iterator, a queue
//! consumer, or a stream receiver) and advances a byte cursor across block
//! boundaries transparently; items straddling two or more blocks are
//! reassembled into a scratch buffer. Round-trip law: any sequence written
//! with [`BlockWriter::put`](super::BlockWriter::put) is returned by
//! [`BlockReader::next`] identically and in order.

use crate::data::block::{Block, PinnedBlock};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;

/// Supplies the reader with consecutive blocks; `None` means end of data.
///
/// Sources may block (queue and stream sources suspend the reader until the
/// producer delivers the next block or closes).
pub trait BlockSource {
    fn next_block(&mut self) -> Result<Option<Block>>;
}

impl BlockSource for Box<dyn BlockSource> {
    fn next_block(&mut self) -> Result<Option<Block>> {
        (**self).next_block()
    }
}

/// Reads typed items out of a block sequence.
pub struct BlockReader<S: BlockSource> {
    source: S,
    pinned: Option<PinnedBlock>,
    cursor: usize,
    end: usize,
    scratch: Vec<u8>,
}

impl<S: BlockSource> BlockReader<S> {
    pub fn new(source: S) -> Self {
        BlockReader {
            source,
            pinned: None,
            cursor: 0,
            end: 0,
            scratch: Vec::new(),
        }
    }

    /// True if another item can be read. May suspend waiting for the
    /// source's next block.
    pub fn has_next(&mut self) -> Result<bool> {
        while self.cursor == self.end {
            match self.source.next_block()? {
                Some(block) => {
                    if block.size() == 0 {
                        continue;
                    }
                    self.cursor = block.begin();
                    self.end = block.end();
                    self.pinned = Some(block.pin()?);
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Deserialize the next item. Calling this when [`Self::has_next`] is
    /// false is a logic error.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<T> {
        if !self.has_next()? {
            return Err(Error::Logic("next() called on exhausted reader".into()));
        }
        let len = self.get_varint()? as usize;
        // Fast path: the item is contiguous in the current block.
        if self.end - self.cursor >= len {
            let pinned = self.pinned.as_ref().expect("current block");
            let bytes = &pinned.data()[self.cursor..self.cursor + len];
            let value = postcard::from_bytes(bytes)?;
            self.cursor += len;
            return Ok(value);
        }
        // Straddling item: reassemble across blocks.
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        self.read_exact_into(len, &mut scratch)?;
        let value = postcard::from_bytes(&scratch);
        self.scratch = scratch;
        Ok(value?)
    }

    /// Skip over the next item without decoding it.
    pub fn skip_item(&mut self) -> Result<()> {
        if !self.has_next()? {
            return Err(Error::Logic("skip on exhausted reader".into()));
        }
        let len = self.get_varint()? as usize;
        self.advance(len)
    }

    /// Read a LEB128 varint, possibly spanning a block boundary.
    pub fn get_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.get_byte()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::Decode("varint overflow".into()));
            }
        }
    }

    fn get_byte(&mut self) -> Result<u8> {
        if self.cursor == self.end && !self.has_next()? {
            return Err(Error::Decode("truncated source".into()));
        }
        let pinned = self.pinned.as_ref().expect("current block");
        let b = pinned.data()[self.cursor];
        self.cursor += 1;
        Ok(b)
    }

    fn read_exact_into(&mut self, mut len: usize, out: &mut Vec<u8>) -> Result<()> {
        out.reserve(len);
        while len > 0 {
            if self.cursor == self.end && !self.has_next()? {
                return Err(Error::Decode("truncated source".into()));
            }
            let pinned = self.pinned.as_ref().expect("current block");
            let take = len.min(self.end - self.cursor);
            out.extend_from_slice(&pinned.data()[self.cursor..self.cursor + take]);
            self.cursor += take;
            len -= take;
        }
        Ok(())
    }

    fn advance(&mut self, mut len: usize) -> Result<()> {
        while len > 0 {
            if self.cursor == self.end && !self.has_next()? {
                return Err(Error::Decode("truncated source".into()));
            }
            let take = len.min(self.end - self.cursor);
            self.cursor += take;
            len -= take;
        }
        Ok(())
    }

    /// Drain the remaining items into a vector.
    pub fn collect_vec<T: DeserializeOwned>(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while self.has_next()? {
            out.push(self.next()?);
        }
        Ok(out)
    }

    /// Apply `f` to every remaining item.
    pub fn for_each<T: DeserializeOwned>(
        &mut self,
        mut f: impl FnMut(T) -> Result<()>,
    ) -> Result<()> {
        while self.has_next()? {
            f(self.next()?)?;
        }
        Ok(())
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }
}
