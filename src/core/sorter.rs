//! External sorter: in-memory run formation plus multi-way merge.
//!
//! Items are buffered until the run budget fills, sorted, and spilled as a
//! file; `finish` merges the runs and emits the items in order. Inputs
//! fitting in one run never touch the pool's files. Ordering guarantee:
//! `finish` emits a permutation of the pushed items sorted by the
//! comparator; the relative order of equal items is unspecified.

use crate::data::file::File;
use crate::data::pool::BlockPool;
use crate::error::Result;
use rayon::slice::ParallelSliceMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Comparator shared between the sorter and the distributed sort operator.
pub type SortCmp<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Buffers, sorts and spills runs of items, then merges them back.
pub struct RunSorter<T> {
    pool: BlockPool,
    cmp: SortCmp<T>,
    run_capacity: usize,
    current: Vec<T>,
    runs: Vec<File>,
}

impl<T> RunSorter<T>
where
    T: Clone + Send + Serialize + DeserializeOwned + 'static,
{
    /// `run_bytes` bounds the memory held by the in-progress run.
    pub fn new(pool: BlockPool, cmp: SortCmp<T>, run_bytes: usize) -> Self {
        let item_bytes = std::mem::size_of::<T>().max(8);
        let run_capacity = (run_bytes / item_bytes).max(64);
        RunSorter {
            pool,
            cmp,
            run_capacity,
            current: Vec::new(),
            runs: Vec::new(),
        }
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        self.current.push(item);
        if self.current.len() >= self.run_capacity {
            self.spill_run()?;
        }
        Ok(())
    }

    fn sort_current(&mut self) {
        let cmp = Arc::clone(&self.cmp);
        self.current.par_sort_unstable_by(|a, b| cmp(a, b));
    }

    fn spill_run(&mut self) -> Result<()> {
        self.sort_current();
        let run = File::new();
        let mut writer = run.writer(&self.pool);
        for item in self.current.drain(..) {
            writer.put(&item)?;
        }
        writer.close()?;
        debug!(run = self.runs.len(), items = run.num_items(), "spilled sort run");
        self.runs.push(run);
        Ok(())
    }

    /// Emit all pushed items in comparator order.
    pub fn finish(mut self, emit: &mut dyn FnMut(T) -> Result<()>) -> Result<()> {
        if self.runs.is_empty() {
            // Everything fit in memory.
            self.sort_current();
            for item in std::mem::take(&mut self.current) {
                emit(item)?;
            }
            return Ok(());
        }
        if !self.current.is_empty() {
            self.spill_run()?;
        }

        // K-way merge over the sorted runs. K stays small (one run per
        // budget-full of input), so a linear scan over the heads is fine.
        let mut readers: Vec<_> = self.runs.iter().map(File::consume_reader).collect();
        let mut heads: Vec<Option<T>> = Vec::with_capacity(readers.len());
        for reader in &mut readers {
            heads.push(if reader.has_next()? {
                Some(reader.next()?)
            } else {
                None
            });
        }
        loop {
            let mut min_idx: Option<usize> = None;
            for (i, head) in heads.iter().enumerate() {
                if let Some(h) = head {
                    match min_idx {
                        None => min_idx = Some(i),
                        Some(m) => {
                            let cur = heads[m].as_ref().expect("tracked head");
                            if (self.cmp)(h, cur) == Ordering::Less {
                                min_idx = Some(i);
                            }
                        }
                    }
                }
            }
            let Some(i) = min_idx else { break };
            let item = heads[i].take().expect("selected head");
            heads[i] = if readers[i].has_next()? {
                Some(readers[i].next()?)
            } else {
                None
            };
            emit(item)?;
        }
        Ok(())
    }

    /// Items pushed so far that have not been spilled.
    pub fn in_memory_items(&self) -> usize {
        self.current.len()
    }

    /// Number of spilled runs.
    pub fn num_runs(&self) -> usize {
        self.runs.len()
    }
}
