//! External-memory hash table for keyed reduction.
//!
//! The key space is split into partitions by a seeded hash. Inserting an
//! item either combines it with the live entry of equal key or adds a new
//! entry; when the table exceeds its budget, the largest partition is
//! spilled: its entries are serialized as `(key, value)` pairs into a
//! per-partition spill file and the partition restarts empty. The flush
//! pass emits unspilled partitions directly and runs a second reduce over
//! spilled ones, re-partitioning with a reseeded hash; recursion past the
//! configured depth fails with [`Error::OutOfMemory`].
//!
//! For every key the emitted value equals the reduction of all inserted
//! items of that key (under the associativity assumption for the reduce
//! function), and each key is emitted exactly once. Emission order is
//! deterministic in partition id; the order within a partition is
//! unspecified.

use crate::common::hash::{hash_value_seeded, mix64};
use crate::data::file::{File, FileSink};
use crate::data::pool::BlockPool;
use crate::data::writer::BlockWriter;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;
use tracing::debug;

/// Sizing knobs for a reduce table.
#[derive(Clone, Debug)]
pub struct ReduceConfig {
    /// Number of logical key-space partitions per table.
    pub num_partitions: usize,
    /// Byte budget for live entries across all partitions.
    pub budget_bytes: usize,
    /// Maximum spill re-hash recursion depth before giving up.
    pub max_spill_depth: usize,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        ReduceConfig {
            num_partitions: 16,
            budget_bytes: 64 << 20,
            max_spill_depth: 4,
        }
    }
}

const BASE_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// A partitioned, spilling reduce table over `(K, V)` entries.
pub struct ReduceTable<K, V> {
    pool: BlockPool,
    config: ReduceConfig,
    reduce: Rc<dyn Fn(V, V) -> V>,
    partitions: Vec<HashMap<K, V>>,
    spill_files: Vec<File>,
    spill_writers: Vec<Option<BlockWriter<FileSink>>>,
    items: usize,
    budget_items: usize,
    seed: u64,
    depth: usize,
}

impl<K, V> ReduceTable<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + 'static,
    V: Serialize + DeserializeOwned + 'static,
{
    pub fn new(pool: BlockPool, config: ReduceConfig, reduce: Rc<dyn Fn(V, V) -> V>) -> Self {
        Self::with_depth(pool, config, reduce, BASE_SEED, 0)
    }

    fn with_depth(
        pool: BlockPool,
        config: ReduceConfig,
        reduce: Rc<dyn Fn(V, V) -> V>,
        seed: u64,
        depth: usize,
    ) -> Self {
        let parts = config.num_partitions.max(1);
        // Entries live in a HashMap; the byte budget is enforced through a
        // per-entry footprint estimate.
        let entry_bytes = std::mem::size_of::<(K, V)>().max(16) + 48;
        let budget_items = (config.budget_bytes / entry_bytes).max(64);
        ReduceTable {
            pool,
            config,
            reduce,
            partitions: (0..parts).map(|_| HashMap::new()).collect(),
            spill_files: (0..parts).map(|_| File::new()).collect(),
            spill_writers: (0..parts).map(|_| None).collect(),
            items: 0,
            budget_items,
            seed,
            depth,
        }
    }

    /// Insert one item, combining with an existing entry of equal key.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let pid = (hash_value_seeded(&key, self.seed) as usize) % self.partitions.len();
        if let Some(prev) = self.partitions[pid].remove(&key) {
            let combined = (self.reduce)(prev, value);
            self.partitions[pid].insert(key, combined);
        } else {
            self.partitions[pid].insert(key, value);
            self.items += 1;
            if self.items > self.budget_items {
                self.spill_largest()?;
            }
        }
        Ok(())
    }

    /// Serialize the fullest partition to its spill file and clear it.
    fn spill_largest(&mut self) -> Result<()> {
        let pid = self
            .partitions
            .iter()
            .enumerate()
            .max_by_key(|(_, p)| p.len())
            .map(|(i, _)| i)
            .expect("at least one partition");
        let drained = std::mem::take(&mut self.partitions[pid]);
        debug!(
            partition = pid,
            entries = drained.len(),
            depth = self.depth,
            "spilling reduce partition"
        );
        self.items -= drained.len();
        if self.spill_writers[pid].is_none() {
            let writer = self.spill_files[pid].appending_writer(&self.pool);
            self.spill_writers[pid] = Some(writer);
        }
        let writer = self.spill_writers[pid].as_mut().expect("writer just opened");
        for (k, v) in drained {
            writer.put(&(k, v))?;
        }
        Ok(())
    }

    /// Emit one `(key, value)` per distinct key ever inserted.
    pub fn flush(mut self, emit: &mut dyn FnMut(K, V) -> Result<()>) -> Result<()> {
        for pid in 0..self.partitions.len() {
            let live = std::mem::take(&mut self.partitions[pid]);
            match self.spill_writers[pid].take() {
                None => {
                    for (k, v) in live {
                        emit(k, v)?;
                    }
                }
                Some(mut writer) => {
                    writer.close()?;
                    drop(writer);
                    if self.depth >= self.config.max_spill_depth {
                        return Err(Error::OutOfMemory(format!(
                            "reduce spill recursion exceeded depth {}",
                            self.config.max_spill_depth
                        )));
                    }
                    // Second reduce over the spilled partition, with a
                    // reseeded hash so a single hot bucket re-partitions.
                    let mut sub = ReduceTable::with_depth(
                        self.pool.clone(),
                        self.config.clone(),
                        Rc::clone(&self.reduce),
                        mix64(self.seed ^ (self.depth as u64 + 1)),
                        self.depth + 1,
                    );
                    for (k, v) in live {
                        sub.insert(k, v)?;
                    }
                    let file = std::mem::take(&mut self.spill_files[pid]);
                    let mut reader = file.consume_reader();
                    while reader.has_next()? {
                        let (k, v): (K, V) = reader.next()?;
                        sub.insert(k, v)?;
                    }
                    sub.flush(emit)?;
                }
            }
        }
        Ok(())
    }

    /// Live entries currently held.
    pub fn num_items(&self) -> usize {
        self.items
    }
}
