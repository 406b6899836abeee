//! Materialization nodes: `cache` and `collapse`.
//!
//! Both fold the pending transformation chain into a node that stores the
//! produced items in a block file and keeps that storage across actions,
//! the one kind of node whose data survives being read. `cache` exists to
//! pay a shuffle or computation once and read it many times; `collapse`
//! exists to erase the pending chain so handles of the same element type
//! can be stored and swapped.

use crate::api::dia::{Dia, Item};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::NodeId;
use crate::data::file::FileSink;
use crate::data::{BlockWriter, File};
use crate::error::Result;
use std::cell::RefCell;
use std::rc::Rc;

struct CacheNode<T: Item> {
    base: NodeBase<T>,
    pre: Rc<RefCell<BlockWriter<FileSink>>>,
    file: File,
    err: ErrorSlot,
}

impl<T: Item> NodeImpl for CacheNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        self.pre.borrow_mut().close()
    }

    fn push_data_impl(&self, child: NodeId, _consume: bool) -> Result<()> {
        // Keep nodes never release on push.
        self.base.push_file(&self.file, child, false)
    }

    fn dispose_impl(&self) {
        self.file.clear();
    }

    fn keep(&self) -> bool {
        true
    }
}

pub(crate) fn cache<T: Item>(input: &Dia<T>, label: &'static str) -> Dia<T> {
    let ctx = input.ctx().clone();
    let file = File::new();
    let pre = Rc::new(RefCell::new(file.writer(ctx.pool())));

    let node = Rc::new(CacheNode {
        base: NodeBase::new(ctx.new_node_id(), label, vec![input.node_rc()]),
        pre: Rc::clone(&pre),
        file,
        err: ErrorSlot::new(),
    });

    let err = node.err.clone();
    input.attach(
        node.base.id(),
        Box::new(move |item: T| {
            if let Err(e) = pre.borrow_mut().put(&item) {
                err.record(e);
            }
        }),
    );
    Dia::from_node(ctx, node)
}
