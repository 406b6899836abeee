//! Inner hash join.
//!
//! Both sides are routed by key hash to the key's owning worker as the
//! items stream through the pre-ops (no local buffering). The receiver
//! materializes the left side into a multimap and streams the right side
//! against it, emitting one output per matching pair. The left side should
//! be the smaller input.

use crate::api::context::Context;
use crate::api::dia::{Dia, Item, Key};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::hash::hash_value;
use crate::common::NodeId;
use crate::data::stream::{MixStream, StreamSink};
use crate::data::{BlockWriter, File};
use crate::error::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

struct InnerJoinNode<A: Item, B: Item, K: Key, Out: Item> {
    base: NodeBase<Out>,
    ctx: Context,
    stream_a: MixStream,
    stream_b: MixStream,
    writers_a: Rc<RefCell<Vec<BlockWriter<StreamSink>>>>,
    writers_b: Rc<RefCell<Vec<BlockWriter<StreamSink>>>>,
    join_fn: Rc<dyn Fn(A, B) -> Out>,
    out_file: File,
    err: ErrorSlot,
    _key: std::marker::PhantomData<K>,
}

impl<A: Item, B: Item, K: Key, Out: Item> NodeImpl for InnerJoinNode<A, B, K, Out> {
    type Out = Out;

    fn base(&self) -> &NodeBase<Out> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        for writer in self.writers_a.borrow_mut().iter_mut() {
            writer.close()?;
        }
        for writer in self.writers_b.borrow_mut().iter_mut() {
            writer.close()?;
        }

        // Build side.
        let mut left: HashMap<K, Vec<A>> = HashMap::new();
        let mut reader = self.stream_a.reader();
        while reader.has_next()? {
            let (k, a): (K, A) = reader.next()?;
            left.entry(k).or_default().push(a);
        }

        // Probe side.
        let mut writer = self.out_file.writer(self.ctx.pool());
        let mut reader = self.stream_b.reader();
        while reader.has_next()? {
            let (k, b): (K, B) = reader.next()?;
            if let Some(matches) = left.get(&k) {
                for a in matches {
                    writer.put(&(self.join_fn)(a.clone(), b.clone()))?;
                }
            }
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

pub(crate) fn inner_join<A: Item, B: Item, K: Key, Out: Item>(
    a: &Dia<A>,
    b: &Dia<B>,
    key_a: Rc<dyn Fn(&A) -> K>,
    key_b: Rc<dyn Fn(&B) -> K>,
    join_fn: Rc<dyn Fn(A, B) -> Out>,
) -> Dia<Out> {
    let ctx = a.ctx().clone();
    let stream_a = ctx.new_mix_stream().expect("allocate join stream");
    let stream_b = ctx.new_mix_stream().expect("allocate join stream");
    let writers_a = Rc::new(RefCell::new(
        stream_a.open_writers().expect("open join writers"),
    ));
    let writers_b = Rc::new(RefCell::new(
        stream_b.open_writers().expect("open join writers"),
    ));
    let workers = ctx.num_workers();

    let node = Rc::new(InnerJoinNode {
        base: NodeBase::new(
            ctx.new_node_id(),
            "inner_join",
            vec![a.node_rc(), b.node_rc()],
        ),
        ctx: ctx.clone(),
        stream_a,
        stream_b,
        writers_a: Rc::clone(&writers_a),
        writers_b: Rc::clone(&writers_b),
        join_fn,
        out_file: File::new(),
        err: ErrorSlot::new(),
        _key: std::marker::PhantomData::<K>,
    });

    let err = node.err.clone();
    a.attach(
        node.base.id(),
        Box::new(move |item: A| {
            let k = key_a(&item);
            let target = (hash_value(&k) as usize) % workers;
            if let Err(e) = writers_a.borrow_mut()[target].put(&(k, item)) {
                err.record(e);
            }
        }),
    );
    let err = node.err.clone();
    b.attach(
        node.base.id(),
        Box::new(move |item: B| {
            let k = key_b(&item);
            let target = (hash_value(&k) as usize) % workers;
            if let Err(e) = writers_b.borrow_mut()[target].put(&(k, item)) {
                err.record(e);
            }
        }),
    );
    Dia::from_node(ctx, node)
}
