//! Keyed reduction operators.
//!
//! Reduction runs in two phases. The pre-phase aggregates locally into a
//! table partitioned by the key's owning worker; when the table exceeds
//! its budget, the fullest partition is shipped to its owner early (the
//! owner re-combines partials, so early shipping only costs bandwidth).
//! The post-phase at the receiver runs the spilling
//! [`ReduceTable`](crate::core::ReduceTable) over the shuffled pairs and
//! emits one output per distinct key.
//!
//! `reduce_to_index` replaces the hash partitioning with dense index
//! ranges and emits a neutral element for indexes no item mapped to, in
//! global index order.

use crate::api::context::Context;
use crate::api::dia::{Dia, Item, Key};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::hash::hash_value;
use crate::common::{local_range, range_owner, NodeId};
use crate::core::reduce_table::ReduceTable;
use crate::data::stream::{MixStream, StreamSink};
use crate::data::{BlockWriter, File};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Pre-phase table: partitioned by owning worker, ships partials early
/// when over budget.
struct PreReduce<K, V> {
    partitions: Vec<HashMap<K, V>>,
    writers: Vec<BlockWriter<StreamSink>>,
    reduce: Rc<dyn Fn(V, V) -> V>,
    items: usize,
    budget_items: usize,
}

impl<K: Key, V: Item> PreReduce<K, V> {
    fn insert(&mut self, key: K, value: V) -> Result<()> {
        let pid = (hash_value(&key) as usize) % self.partitions.len();
        if let Some(prev) = self.partitions[pid].remove(&key) {
            self.partitions[pid].insert(key, (self.reduce)(prev, value));
        } else {
            self.partitions[pid].insert(key, value);
            self.items += 1;
            if self.items > self.budget_items {
                self.ship_largest()?;
            }
        }
        Ok(())
    }

    /// Flush the fullest partition to its owning worker.
    fn ship_largest(&mut self) -> Result<()> {
        let pid = self
            .partitions
            .iter()
            .enumerate()
            .max_by_key(|(_, p)| p.len())
            .map(|(i, _)| i)
            .expect("at least one partition");
        let drained = std::mem::take(&mut self.partitions[pid]);
        self.items -= drained.len();
        for (k, v) in drained {
            self.writers[pid].put(&(k, v))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for pid in 0..self.partitions.len() {
            for (k, v) in std::mem::take(&mut self.partitions[pid]) {
                self.writers[pid].put(&(k, v))?;
            }
        }
        self.items = 0;
        for writer in &mut self.writers {
            writer.close()?;
        }
        Ok(())
    }
}

struct ReduceNode<K: Key, V: Item, Out: Item> {
    base: NodeBase<Out>,
    ctx: Context,
    stream: MixStream,
    pre: Rc<RefCell<PreReduce<K, V>>>,
    reduce: Rc<dyn Fn(V, V) -> V>,
    compose: Rc<dyn Fn(K, V) -> Out>,
    out_file: File,
    err: ErrorSlot,
}

impl<K: Key, V: Item, Out: Item> NodeImpl for ReduceNode<K, V, Out> {
    type Out = Out;

    fn base(&self) -> &NodeBase<Out> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        self.pre.borrow_mut().finish()?;

        let mut table: ReduceTable<K, V> = ReduceTable::new(
            self.ctx.pool().clone(),
            self.ctx.config().reduce.clone(),
            Rc::clone(&self.reduce),
        );
        let mut reader = self.stream.reader();
        while reader.has_next()? {
            let (k, v): (K, V) = reader.next()?;
            table.insert(k, v)?;
        }

        let mut writer = self.out_file.writer(self.ctx.pool());
        let compose = Rc::clone(&self.compose);
        table.flush(&mut |k, v| writer.put(&compose(k, v)))?;
        writer.close()
    }

    fn push_data_impl(&self, child: NodeId, consume: bool) -> Result<()> {
        self.base.push_file(&self.out_file, child, consume)
    }

    fn dispose_impl(&self) {
        self.out_file.clear();
    }
}

/// Build a reduction node over `input`. `extract` splits an incoming item
/// into key and value, `compose` rebuilds the output from the final pair.
pub(crate) fn reduce_node<In: Item, K: Key, V: Item, Out: Item>(
    input: &Dia<In>,
    label: &'static str,
    extract: Rc<dyn Fn(In) -> (K, V)>,
    reduce: Rc<dyn Fn(V, V) -> V>,
    compose: Rc<dyn Fn(K, V) -> Out>,
) -> Dia<Out> {
    let ctx = input.ctx().clone();
    let stream = ctx.new_mix_stream().expect("allocate reduce stream");
    let writers = stream.open_writers().expect("open reduce writers");
    let workers = ctx.num_workers();

    let entry_bytes = std::mem::size_of::<(K, V)>().max(16) + 48;
    let budget_items = (ctx.config().reduce.budget_bytes / entry_bytes).max(64);
    let pre = Rc::new(RefCell::new(PreReduce {
        partitions: (0..workers).map(|_| HashMap::new()).collect(),
        writers,
        reduce: Rc::clone(&reduce),
        items: 0,
        budget_items,
    }));

    let node = Rc::new(ReduceNode {
        base: NodeBase::new(ctx.new_node_id(), label, vec![input.node_rc()]),
        ctx: ctx.clone(),
        stream,
        pre: Rc::clone(&pre),
        reduce,
        compose,
        out_file: File::new(),
        err: ErrorSlot::new(),
    });

    let err = node.err.clone();
    input.attach(
        node.base.id(),
        Box::new(move |item: In| {
            let (k, v) = extract(item);
            if let Err(e) = pre.borrow_mut().insert(k, v) {
                err.record(e);
            }
        }),
    );
    Dia::from_node(ctx, node)
}

/// Dense-index reduction node.
struct ReduceToIndexNode<T: Item> {
    base: NodeBase<T>,
    ctx: Context,
    stream: MixStream,
    pre: Rc<RefCell<PreIndex<T>>>,
    reduce: Rc<dyn Fn(T, T) -> T>,
    size: usize,
    neutral: T,
    out_file: File,
    err: ErrorSlot,
}

struct PreIndex<T> {
    entries: HashMap<usize, T>,
    writers: Vec<BlockWriter<StreamSink>>,
}

impl<T: Item> NodeImpl for ReduceToIndexNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        let workers = self.ctx.num_workers();
        {
            let mut pre = self.pre.borrow_mut();
            let entries = std::mem::take(&mut pre.entries);
            for (idx, v) in entries {
                let owner = range_owner(self.size, workers, idx);
                pre.writers[owner].put(&(idx, v))?;
            }
            for writer in &mut pre.writers {
                writer.close()?;
            }
        }

        let my_range = local_range(self.size, workers, self.ctx.global_rank());
        let mut slots: Vec<Option<T>> = vec![None; my_range.size()];
        let mut reader = self.stream.reader();
        while reader.has_next()? {
            let (idx, v): (usize, T) = reader.next()?;
            debug_assert!(my_range.contains(idx));
            let slot = &mut slots[idx - my_range.begin];
            *slot = Some(match slot.take() {
                Some(prev) => (self.reduce)(prev, v),
                None => v,
            });
        }

        let mut writer = self.out_file.writer(self.ctx.pool());
        for slot in slots {
            writer.put(&slot.unwrap_or_else(|| self.neutral.clone()))?;
        }
        writer.close()
    }

    fn push_data_impl(&self, child: NodeId, consume: bool) -> Result<()> {
        self.base.push_file(&self.out_file, child, consume)
    }

    fn dispose_impl(&self) {
        self.out_file.clear();
    }
}

pub(crate) fn reduce_to_index<T: Item>(
    input: &Dia<T>,
    index_fn: Rc<dyn Fn(&T) -> usize>,
    reduce: Rc<dyn Fn(T, T) -> T>,
    size: usize,
    neutral: T,
) -> Dia<T> {
    let ctx = input.ctx().clone();
    let stream = ctx.new_mix_stream().expect("allocate reduce stream");
    let writers = stream.open_writers().expect("open reduce writers");
    let pre = Rc::new(RefCell::new(PreIndex {
        entries: HashMap::new(),
        writers,
    }));

    let node = Rc::new(ReduceToIndexNode {
        base: NodeBase::new(ctx.new_node_id(), "reduce_to_index", vec![input.node_rc()]),
        ctx: ctx.clone(),
        stream,
        pre: Rc::clone(&pre),
        reduce: Rc::clone(&reduce),
        size,
        neutral,
        out_file: File::new(),
        err: ErrorSlot::new(),
    });

    let err = node.err.clone();
    let index_fn = Rc::clone(&index_fn);
    let reduce_pre = reduce;
    input.attach(
        node.base.id(),
        Box::new(move |item: T| {
            let idx = index_fn(&item);
            if idx >= size {
                err.record(Error::Config(format!(
                    "reduce_to_index: index {idx} out of range 0..{size}"
                )));
                return;
            }
            let mut pre = pre.borrow_mut();
            let merged = match pre.entries.remove(&idx) {
                Some(prev) => reduce_pre(prev, item),
                None => item,
            };
            pre.entries.insert(idx, merged);
        }),
    );
    Dia::from_node(ctx, node)
}
