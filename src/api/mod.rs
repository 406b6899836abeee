//! The program-facing layer: contexts, the `Dia` collection handle, its
//! operators and the stage scheduler.

pub mod context;
pub mod dia;
pub mod io;
pub mod node;
pub mod source;

pub(crate) mod actions;
pub(crate) mod cache;
pub(crate) mod group;
pub(crate) mod join;
pub(crate) mod merge;
pub(crate) mod prefix_sum;
pub(crate) mod reduce;
pub(crate) mod sample;
pub(crate) mod sort;
pub(crate) mod window;
pub(crate) mod zip;

pub use context::{run_local, run_local_auto, run_local_with, Context, HostContext, JobConfig};
pub use dia::{Dia, Item, Key};
pub use io::{read_binary, read_lines};
pub use node::{DiaNode, NodeState};
pub use source::{
    concat_to_dia, distribute, distribute_from, equal_to_dia, generate, generate_with,
};
