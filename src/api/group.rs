//! Grouping operators.
//!
//! Items are routed to the key's owning worker (hash partitioning for
//! `group_by_key`, dense index ranges for `group_to_index`) and collected
//! into per-key groups at the receiver, which folds each group with the
//! user's group function. Groups are materialized in memory at the
//! receiver; keyed aggregations that fit a combine function should prefer
//! the spilling reduce operators.

use crate::api::context::Context;
use crate::api::dia::{Dia, Item, Key};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::hash::hash_value;
use crate::common::{local_range, range_owner, NodeId};
use crate::data::stream::{MixStream, StreamSink};
use crate::data::{BlockWriter, File};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

struct GroupByKeyNode<K: Key, V: Item, Out: Item> {
    base: NodeBase<Out>,
    ctx: Context,
    stream: MixStream,
    writers: Rc<RefCell<Vec<BlockWriter<StreamSink>>>>,
    group_fn: Rc<dyn Fn(K, Vec<V>) -> Out>,
    out_file: File,
    err: ErrorSlot,
}

impl<K: Key, V: Item, Out: Item> NodeImpl for GroupByKeyNode<K, V, Out> {
    type Out = Out;

    fn base(&self) -> &NodeBase<Out> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        for writer in self.writers.borrow_mut().iter_mut() {
            writer.close()?;
        }

        let mut groups: HashMap<K, Vec<V>> = HashMap::new();
        let mut reader = self.stream.reader();
        while reader.has_next()? {
            let (k, v): (K, V) = reader.next()?;
            groups.entry(k).or_default().push(v);
        }

        let mut writer = self.out_file.writer(self.ctx.pool());
        for (k, vs) in groups {
            writer.put(&(self.group_fn)(k, vs))?;
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

pub(crate) fn group_by_key<In: Item, K: Key, Out: Item>(
    input: &Dia<In>,
    key_fn: Rc<dyn Fn(&In) -> K>,
    group_fn: Rc<dyn Fn(K, Vec<In>) -> Out>,
) -> Dia<Out> {
    let ctx = input.ctx().clone();
    let stream = ctx.new_mix_stream().expect("allocate group stream");
    let writers = Rc::new(RefCell::new(
        stream.open_writers().expect("open group writers"),
    ));
    let workers = ctx.num_workers();

    let node = Rc::new(GroupByKeyNode {
        base: NodeBase::new(ctx.new_node_id(), "group_by_key", vec![input.node_rc()]),
        ctx: ctx.clone(),
        stream,
        writers: Rc::clone(&writers),
        group_fn,
        out_file: File::new(),
        err: ErrorSlot::new(),
    });

    let err = node.err.clone();
    input.attach(
        node.base.id(),
        Box::new(move |item: In| {
            let k = key_fn(&item);
            let target = (hash_value(&k) as usize) % workers;
            if let Err(e) = writers.borrow_mut()[target].put(&(k, item)) {
                err.record(e);
            }
        }),
    );
    Dia::from_node(ctx, node)
}

struct GroupToIndexNode<V: Item, Out: Item> {
    base: NodeBase<Out>,
    ctx: Context,
    stream: MixStream,
    writers: Rc<RefCell<Vec<BlockWriter<StreamSink>>>>,
    group_fn: Rc<dyn Fn(usize, Vec<V>) -> Out>,
    size: usize,
    out_file: File,
    err: ErrorSlot,
}

impl<V: Item, Out: Item> NodeImpl for GroupToIndexNode<V, Out> {
    type Out = Out;

    fn base(&self) -> &NodeBase<Out> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        for writer in self.writers.borrow_mut().iter_mut() {
            writer.close()?;
        }

        let my_range = local_range(self.size, self.ctx.num_workers(), self.ctx.global_rank());
        let mut groups: Vec<Vec<V>> = vec![Vec::new(); my_range.size()];
        let mut reader = self.stream.reader();
        while reader.has_next()? {
            let (idx, v): (usize, V) = reader.next()?;
            debug_assert!(my_range.contains(idx));
            groups[idx - my_range.begin].push(v);
        }

        // Dense emission in index order; empty groups see an empty vector.
        let mut writer = self.out_file.writer(self.ctx.pool());
        for (off, vs) in groups.into_iter().enumerate() {
            writer.put(&(self.group_fn)(my_range.begin + off, vs))?;
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

pub(crate) fn group_to_index<In: Item, Out: Item>(
    input: &Dia<In>,
    index_fn: Rc<dyn Fn(&In) -> usize>,
    group_fn: Rc<dyn Fn(usize, Vec<In>) -> Out>,
    size: usize,
) -> Dia<Out> {
    let ctx = input.ctx().clone();
    let stream = ctx.new_mix_stream().expect("allocate group stream");
    let writers = Rc::new(RefCell::new(
        stream.open_writers().expect("open group writers"),
    ));
    let workers = ctx.num_workers();

    let node = Rc::new(GroupToIndexNode {
        base: NodeBase::new(ctx.new_node_id(), "group_to_index", vec![input.node_rc()]),
        ctx: ctx.clone(),
        stream,
        writers: Rc::clone(&writers),
        group_fn,
        size,
        out_file: File::new(),
        err: ErrorSlot::new(),
    });

    let err = node.err.clone();
    input.attach(
        node.base.id(),
        Box::new(move |item: In| {
            let idx = index_fn(&item);
            if idx >= size {
                err.record(Error::Config(format!(
                    "group_to_index: index {idx} out of range 0..{size}"
                )));
                return;
            }
            let owner = range_owner(size, workers, idx);
            if let Err(e) = writers.borrow_mut()[owner].put(&(idx, item)) {
                err.record(e);
            }
        }),
    );
    Dia::from_node(ctx, node)
}
