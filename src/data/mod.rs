//! The block-based data layer: byte blocks and their pool, typed
//! writers/readers, and the three block sinks/sources with differing
//! lifetime semantics (persistent [`File`], SPSC [`BlockQueue`], all-to-all
//! [`stream`]s routed by the per-host [`Multiplexer`]).

pub mod block;
pub mod file;
pub mod multiplexer;
pub mod pool;
pub mod queue;
pub mod reader;
pub mod stream;
pub mod writer;

pub use block::{Block, ByteBlock, PinnedBlock};
pub use file::File;
pub use multiplexer::{Multiplexer, StreamId};
pub use pool::{BlockPool, PoolConfig, PoolStats};
pub use queue::BlockQueue;
pub use reader::{BlockReader, BlockSource};
pub use stream::{CatStream, MixStream, StreamKind};
pub use writer::{BlockSink, BlockWriter};
