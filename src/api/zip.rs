//! Element-wise zip of two equally sized collections.
//!
//! Both inputs are buffered locally; a collective establishes each
//! worker's global item offsets and the common total size. Items are then
//! re-ranged: global index `g` goes to the worker owning `g` under
//! balanced splitting, over one shuffle per input. Because senders scan in
//! order and the cat reader concatenates in sender-rank order, each
//! receiver obtains both of its ranges in global index order and zips them
//! pairwise. Differing total sizes are a configuration error.

use crate::api::context::Context;
use crate::api::dia::{Dia, Item};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::{range_owner, NodeId};
use crate::data::file::FileSink;
use crate::data::stream::CatStream;
use crate::data::{BlockWriter, File};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::rc::Rc;

struct ZipNode<A: Item, B: Item, Out: Item> {
    base: NodeBase<Out>,
    ctx: Context,
    stream_a: CatStream,
    stream_b: CatStream,
    pre_a: Rc<RefCell<BlockWriter<FileSink>>>,
    pre_b: Rc<RefCell<BlockWriter<FileSink>>>,
    local_a: File,
    local_b: File,
    recv_a: File,
    recv_b: File,
    zip_fn: Rc<dyn Fn(A, B) -> Out>,
    err: ErrorSlot,
}

impl<A: Item, B: Item, Out: Item> ZipNode<A, B, Out> {
    fn route<T: Item>(
        &self,
        local: &File,
        stream: &CatStream,
        my_offset: usize,
        total: usize,
    ) -> Result<()> {
        let workers = self.ctx.num_workers();
        let mut writers = stream.open_writers()?;
        let mut reader = local.consume_reader();
        let mut g = my_offset;
        while reader.has_next()? {
            let item: T = reader.next()?;
            writers[range_owner(total, workers, g)].put(&item)?;
            g += 1;
        }
        for writer in &mut writers {
            writer.close()?;
        }
        Ok(())
    }

    fn receive<T: Item>(&self, stream: &CatStream, into: &File) -> Result<()> {
        let mut writer = into.writer(self.ctx.pool());
        let mut reader = stream.reader();
        while reader.has_next()? {
            writer.put(&reader.next::<T>()?)?;
        }
        writer.close()
    }
}

impl<A: Item, B: Item, Out: Item> NodeImpl for ZipNode<A, B, Out> {
    type Out = Out;

    fn base(&self) -> &NodeBase<Out> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        self.pre_a.borrow_mut().close()?;
        self.pre_b.borrow_mut().close()?;

        let flow = self.ctx.flow();
        let counts: Vec<(usize, usize)> =
            flow.all_gather(&(self.local_a.num_items(), self.local_b.num_items()))?;
        let total_a: usize = counts.iter().map(|(a, _)| a).sum();
        let total_b: usize = counts.iter().map(|(_, b)| b).sum();
        if total_a != total_b {
            return Err(Error::Config(format!(
                "zip requires equal sizes, got {total_a} and {total_b}"
            )));
        }
        let my_rank = self.ctx.global_rank();
        let offset_a: usize = counts[..my_rank].iter().map(|(a, _)| a).sum();
        let offset_b: usize = counts[..my_rank].iter().map(|(_, b)| b).sum();

        if total_a > 0 {
            self.route::<A>(&self.local_a, &self.stream_a, offset_a, total_a)?;
            self.route::<B>(&self.local_b, &self.stream_b, offset_b, total_a)?;
        } else {
            // Still deliver end-of-stream markers.
            for writer in &mut self.stream_a.open_writers()? {
                writer.close()?;
            }
            for writer in &mut self.stream_b.open_writers()? {
                writer.close()?;
            }
        }
        self.receive::<A>(&self.stream_a, &self.recv_a)?;
        self.receive::<B>(&self.stream_b, &self.recv_b)
    }

    fn push_data_impl(&self, child: NodeId, consume: bool) -> Result<()> {
        self.base.push_with(child, |emit| {
            let mut ra = self.recv_a.reader_dyn(consume);
            let mut rb = self.recv_b.reader_dyn(consume);
            while ra.has_next()? && rb.has_next()? {
                emit((self.zip_fn)(ra.next()?, rb.next()?));
            }
            Ok(())
        })
    }

    fn dispose_impl(&self) {
        self.recv_a.clear();
        self.recv_b.clear();
    }
}

pub(crate) fn zip<A: Item, B: Item, Out: Item>(
    a: &Dia<A>,
    b: &Dia<B>,
    zip_fn: Rc<dyn Fn(A, B) -> Out>,
) -> Dia<Out> {
    let ctx = a.ctx().clone();
    let stream_a = ctx.new_cat_stream().expect("allocate zip stream");
    let stream_b = ctx.new_cat_stream().expect("allocate zip stream");
    let local_a = File::new();
    let local_b = File::new();
    let pre_a = Rc::new(RefCell::new(local_a.writer(ctx.pool())));
    let pre_b = Rc::new(RefCell::new(local_b.writer(ctx.pool())));

    let node = Rc::new(ZipNode {
        base: NodeBase::new(ctx.new_node_id(), "zip", vec![a.node_rc(), b.node_rc()]),
        ctx: ctx.clone(),
        stream_a,
        stream_b,
        pre_a: Rc::clone(&pre_a),
        pre_b: Rc::clone(&pre_b),
        local_a,
        local_b,
        recv_a: File::new(),
        recv_b: File::new(),
        zip_fn,
        err: ErrorSlot::new(),
    });

    let err_a = node.err.clone();
    a.attach(
        node.base.id(),
        Box::new(move |item: A| {
            if let Err(e) = pre_a.borrow_mut().put(&item) {
                err_a.record(e);
            }
        }),
    );
    let err_b = node.err.clone();
    b.attach(
        node.base.id(),
        Box::new(move |item: B| {
            if let Err(e) = pre_b.borrow_mut().put(&item) {
                err_b.record(e);
            }
        }),
    );
    Dia::from_node(ctx, node)
}
