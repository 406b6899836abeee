//! Global prefix sums.
//!
//! The pre-op buffers items locally and folds a running local sum. One
//! collective gathers the per-worker sums; each worker folds the sums of
//! lower ranks onto the initial value to obtain its offset, and the push
//! phase re-scans the buffered items accumulating from that offset.
//! Inclusive output at global position i covers items 0..=i, exclusive
//! output covers items 0..i, both seeded with the initial value.

use crate::api::context::Context;
use crate::api::dia::{Dia, Item};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::NodeId;
use crate::data::file::FileSink;
use crate::data::{BlockWriter, File};
use crate::error::Result;
use std::cell::RefCell;
use std::rc::Rc;

struct PrefixSumPre<T> {
    writer: BlockWriter<FileSink>,
    local_sum: Option<T>,
}

struct PrefixSumNode<T: Item> {
    base: NodeBase<T>,
    ctx: Context,
    pre: Rc<RefCell<PrefixSumPre<T>>>,
    local: File,
    op: Rc<dyn Fn(T, T) -> T>,
    initial: T,
    inclusive: bool,
    offset: RefCell<Option<T>>,
    err: ErrorSlot,
}

impl<T: Item> NodeImpl for PrefixSumNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        let local_sum = {
            let mut pre = self.pre.borrow_mut();
            pre.writer.close()?;
            pre.local_sum.take()
        };
        let sums: Vec<Option<T>> = self.ctx.flow().all_gather(&local_sum)?;
        let mut acc = self.initial.clone();
        for sum in sums.into_iter().take(self.ctx.global_rank()).flatten() {
            acc = (self.op)(acc, sum);
        }
        *self.offset.borrow_mut() = Some(acc);
        Ok(())
    }

    fn push_data_impl(&self, child: NodeId, consume: bool) -> Result<()> {
        self.base.push_with(child, |emit| {
            let mut acc = self
                .offset
                .borrow()
                .clone()
                .expect("offset computed in execute");
            let mut reader = self.local.reader_dyn(consume);
            while reader.has_next()? {
                let item: T = reader.next()?;
                if self.inclusive {
                    acc = (self.op)(acc, item);
                    emit(acc.clone());
                } else {
                    emit(acc.clone());
                    acc = (self.op)(acc, item);
                }
            }
            Ok(())
        })
    }

    fn dispose_impl(&self) {
        self.local.clear();
    }
}

pub(crate) fn prefix_sum<T: Item>(
    input: &Dia<T>,
    op: Rc<dyn Fn(T, T) -> T>,
    initial: T,
    inclusive: bool,
) -> Dia<T> {
    let ctx = input.ctx().clone();
    let local = File::new();
    let pre = Rc::new(RefCell::new(PrefixSumPre {
        writer: local.writer(ctx.pool()),
        local_sum: None,
    }));

    let node = Rc::new(PrefixSumNode {
        base: NodeBase::new(
            ctx.new_node_id(),
            if inclusive {
                "prefix_sum"
            } else {
                "ex_prefix_sum"
            },
            vec![input.node_rc()],
        ),
        ctx: ctx.clone(),
        pre: Rc::clone(&pre),
        local,
        op: Rc::clone(&op),
        initial,
        inclusive,
        offset: RefCell::new(None),
        err: ErrorSlot::new(),
    });

    let err = node.err.clone();
    input.attach(
        node.base.id(),
        Box::new(move |item: T| {
            let mut pre = pre.borrow_mut();
            if let Err(e) = pre.writer.put(&item) {
                err.record(e);
                return;
            }
            pre.local_sum = Some(match pre.local_sum.take() {
                Some(prev) => op(prev, item),
                None => item,
            });
        }),
    );
    Dia::from_node(ctx, node)
}
