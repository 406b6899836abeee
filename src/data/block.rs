//! Byte blocks and block views.
//!
//! A [`ByteBlock`] is a sealed, reference-counted byte region owned by the
//! process-wide [`BlockPool`](crate::data::BlockPool). It is either fully
//! resident in memory or fully evicted to the pool's swap file, never
//! partial. A [`Block`] is a cheap view into a `ByteBlock` carrying the item
//! boundary metadata that lets a reader restart at any block: the valid byte
//! range, the offset of the first item that *starts* inside the range
//! (earlier bytes belong to an item split from the previous block) and the
//! number of items starting inside it.

use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, Weak};

use super::pool::PoolShared;

/// A sealed, refcounted byte region managed by a block pool.
///
/// Access to the bytes goes through [`Block::pin`], which guarantees the
/// block is resident for the lifetime of the returned [`PinnedBlock`].
pub struct ByteBlock {
    pub(crate) id: u64,
    pub(crate) capacity: usize,
    pub(crate) pool: Weak<PoolShared>,
    pub(crate) state: Mutex<BlockState>,
    /// Signalled when an in-flight eviction or load completes.
    pub(crate) io_done: Condvar,
}

pub(crate) struct BlockState {
    /// Resident bytes; `None` while evicted to the swap file.
    pub data: Option<Arc<[u8]>>,
    /// Blocks with `pin_count > 0` may not be evicted.
    pub pin_count: usize,
    /// Swap-file offset while evicted.
    pub swap_offset: Option<u64>,
    /// True while an eviction write or pin load is in flight.
    pub io_in_flight: bool,
}

impl ByteBlock {
    /// Size of the underlying byte region.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True if the bytes are currently in memory.
    pub fn is_resident(&self) -> bool {
        self.state.lock().unwrap().data.is_some()
    }
}

impl Drop for ByteBlock {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self);
        }
    }
}

/// A view into a [`ByteBlock`] with item boundary bookkeeping.
///
/// Multiple blocks can reference the same byte region with different
/// bookkeeping. The invariant maintained by the writer: reading from
/// `first_item` of block k and continuing into block k+1 yields well-formed
/// items.
#[derive(Clone)]
pub struct Block {
    byte_block: Arc<ByteBlock>,
    begin: usize,
    end: usize,
    first_item: usize,
    num_items: usize,
}

impl Block {
    pub(crate) fn new(
        byte_block: Arc<ByteBlock>,
        begin: usize,
        end: usize,
        first_item: usize,
        num_items: usize,
    ) -> Self {
        debug_assert!(begin <= end);
        debug_assert!(end <= byte_block.capacity);
        debug_assert!(first_item <= end - begin);
        Block {
            byte_block,
            begin,
            end,
            first_item,
            num_items,
        }
    }

    /// Number of valid bytes in the view.
    pub fn size(&self) -> usize {
        self.end - self.begin
    }

    /// Begin offset of the valid range within the byte block.
    pub fn begin(&self) -> usize {
        self.begin
    }

    /// End offset of the valid range within the byte block.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Offset (relative to `begin`) of the first complete item, equal to
    /// `size()` when no item starts inside this block.
    pub fn first_item(&self) -> usize {
        self.first_item
    }

    /// Number of items starting inside this block.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub(crate) fn byte_block(&self) -> &Arc<ByteBlock> {
        &self.byte_block
    }

    /// Return a derived view that starts at this block's first complete
    /// item. Used to seek a reader to an item boundary.
    pub(crate) fn trim_to_first_item(&self) -> Block {
        Block {
            byte_block: Arc::clone(&self.byte_block),
            begin: self.begin + self.first_item,
            end: self.end,
            first_item: 0,
            num_items: self.num_items,
        }
    }

    /// Pin the underlying byte block, loading it from the swap file if it
    /// was evicted, and return a handle with direct byte access.
    pub fn pin(&self) -> Result<PinnedBlock> {
        let pool = self
            .byte_block
            .pool
            .upgrade()
            .ok_or_else(|| Error::Logic("block outlived its pool".into()))?;
        pool.pin(&self.byte_block)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("first_item", &self.first_item)
            .field("num_items", &self.num_items)
            .finish()
    }
}

/// A pin on a resident byte block. While any pin exists the block cannot be
/// evicted and its bytes are address-stable.
pub struct PinnedBlock {
    pub(crate) block: Arc<ByteBlock>,
    pub(crate) data: Arc<[u8]>,
}

impl PinnedBlock {
    /// The full byte region of the pinned block.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        if let Some(pool) = self.block.pool.upgrade() {
            pool.unpin(&self.block);
        }
    }
}
