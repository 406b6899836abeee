//! # Millrace
//!
//! A **distributed batch data-processing engine** for Rust. A cluster of
//! workers cooperatively executes a dataflow program expressed as a DAG of
//! transformations over large, partitioned collections: the user program
//! chains operators over a [`Dia`] handle, and the engine schedules the
//! DAG, partitions data across workers, shuffles blocks between hosts,
//! spills to disk when memory runs out, and materializes results.
//!
//! ## Quick Start
//!
//! ```no_run
//! use millrace::*;
//!
//! fn main() -> millrace::Result<()> {
//!     // Two hosts with two workers each, connected in-process.
//!     run_local(2, 2, |ctx| {
//!         let lines = distribute_from(
//!             ctx,
//!             vec!["this is a test".to_string(), "this is fine".to_string()],
//!             0,
//!         );
//!         let counts = lines
//!             .flat_map(|l: String| {
//!                 l.split_whitespace().map(str::to_string).collect::<Vec<_>>()
//!             })
//!             .map(|w| (w, 1u64))
//!             .reduce_pair(|a, b| a + b);
//!         let words = counts.all_gather()?;
//!         assert_eq!(words.len(), 5);
//!         Ok(())
//!     })
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### `Dia<T>`
//!
//! A [`Dia`] (distributed immutable array) is the handle to a partitioned
//! collection. Collections are:
//! - **Immutable** - transformations create new collections
//! - **Lazy** - nothing runs until an action is called
//! - **Unordered across workers** - unless produced by `sort`
//!
//! Stateless transformations (`map`, `filter`, `flat_map`) are fused into
//! a single per-item chain and never materialize intermediate data.
//! Distributed operations (`reduce_by_key`, `group_by_key`, `sort`,
//! `zip`, `merge_with`, `inner_join_with`, `prefix_sum`, `window`, ...)
//! shuffle data between workers. Actions (`size`, `sum`, `min`, `max`,
//! `all_gather`, `hyperloglog`, `write_lines`, ...) trigger execution and
//! return a value on every worker.
//!
//! ### Workers and hosts
//!
//! A job runs on `H` hosts with `W` local workers each, forming `P = H*W`
//! global workers with dense ranks. Hosts share a block pool and a
//! multiplexer; transfers between workers of one host bypass the
//! transport. [`run_local`] spawns the whole group in-process over a mesh
//! transport, which is also what the test suite runs on.
//!
//! ### Blocks and spilling
//!
//! All materialized data lives in reference-counted byte blocks owned by
//! a per-host [`data::BlockPool`]. When resident bytes exceed the
//! configured soft limit, unpinned blocks are evicted to a swap file and
//! transparently loaded back on access. Reductions spill oversized hash
//! table partitions to block files, and the distributed sort forms
//! on-disk runs, so operators keep working past the memory budget.
//!
//! ## Module Overview
//!
//! - [`api`] - `Context`, `Dia`, operators, actions and the scheduler
//! - [`data`] - blocks, pool, typed writers/readers, files, queues,
//!   shuffle streams and the multiplexer
//! - [`net`] - transport abstraction and worker-group collectives
//! - [`core`] - spilling reduce table, external sorter, HyperLogLog
//! - [`vfs`] - file globbing and byte streams for line/binary I/O
//! - [`testing`] - collection assertions and the multi-topology harness

pub mod api;
pub mod common;
pub mod core;
pub mod data;
pub mod error;
pub mod net;
pub mod testing;
pub mod vfs;

// General re-exports
pub use api::{
    concat_to_dia, distribute, distribute_from, equal_to_dia, generate, generate_with,
    read_binary, read_lines, run_local, run_local_auto, run_local_with, Context, Dia, Item,
    JobConfig, Key,
};
pub use crate::core::reduce_table::ReduceConfig;
pub use data::{BlockPool, PoolConfig};
pub use error::{Error, Result};
pub use net::ReduceOrder;
