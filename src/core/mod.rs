//! Engine cores used by the distributed operators: the spilling reduce
//! table, the external run sorter, and the HyperLogLog sketch.

pub mod hll;
pub mod reduce_table;
pub mod sorter;

pub use hll::HyperLogLog;
pub use reduce_table::{ReduceConfig, ReduceTable};
pub use sorter::RunSorter;
