//! Actions: operators that trigger execution and return a plain value.
//!
//! Every action is a leaf node whose pre-op folds the incoming items into
//! a small local state and whose execute step runs one collective so all
//! workers return the same value. Actions run eagerly: constructing one
//! invokes the stage scheduler before returning.

use crate::api::dia::{Dia, Item};
use crate::api::node::{run_scope, DiaNode, ErrorSlot, NodeBase, NodeImpl};
use crate::common::NodeId;
use crate::core::hll::HyperLogLog;
use crate::error::{Error, Result};
use crate::net::ReduceOrder;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Generic action node: the collective step is injected as a closure that
/// produces the action's result.
struct ActionNode<R: 'static> {
    base: NodeBase<()>,
    exec: RefCell<Option<Box<dyn FnOnce() -> Result<R>>>>,
    result: RefCell<Option<R>>,
    err: ErrorSlot,
}

impl<R: 'static> NodeImpl for ActionNode<R> {
    type Out = ();

    fn base(&self) -> &NodeBase<()> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        let exec = self
            .exec
            .borrow_mut()
            .take()
            .ok_or_else(|| Error::Logic("action executed twice".into()))?;
        *self.result.borrow_mut() = Some(exec()?);
        Ok(())
    }

    fn push_data_impl(&self, _child: NodeId, _consume: bool) -> Result<()> {
        Ok(())
    }
}

/// Wire an action below `dia`: register `preop` as the fused item sink,
/// run the stage, and return what `exec` computed.
fn run_action<T: Item, R: 'static>(
    dia: &Dia<T>,
    label: &'static str,
    preop: Box<dyn FnMut(T)>,
    exec: Box<dyn FnOnce() -> Result<R>>,
    err: ErrorSlot,
) -> Result<R> {
    let ctx = dia.ctx().clone();
    let node = Rc::new(ActionNode {
        base: NodeBase::new(ctx.new_node_id(), label, vec![dia.node_rc()]),
        exec: RefCell::new(Some(exec)),
        result: RefCell::new(None),
        err,
    });
    dia.attach(node.base.id(), preop);
    run_scope(&ctx, &(Rc::clone(&node) as Rc<dyn DiaNode>))?;
    node.result
        .borrow_mut()
        .take()
        .ok_or_else(|| Error::Logic("action produced no result".into()))
}

/// Total number of items.
pub(crate) fn size<T: Item>(dia: &Dia<T>) -> Result<usize> {
    let count = Rc::new(Cell::new(0usize));
    let flow = dia.ctx().flow();
    let c = Rc::clone(&count);
    run_action(
        dia,
        "size",
        Box::new(move |_item: T| c.set(c.get() + 1)),
        Box::new(move || flow.all_reduce(&count.get(), ReduceOrder::Ordered, |a, b| a + b)),
        ErrorSlot::new(),
    )
}

/// Fold all items with `op`, seeded with `initial` when given; an empty
/// collection without an initial value is a logic error.
pub(crate) fn fold<T: Item>(
    dia: &Dia<T>,
    label: &'static str,
    op: Rc<dyn Fn(T, T) -> T>,
    initial: Option<T>,
) -> Result<T> {
    let acc: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
    let flow = dia.ctx().flow();
    let acc_pre = Rc::clone(&acc);
    let op_pre = Rc::clone(&op);
    run_action(
        dia,
        label,
        Box::new(move |item: T| {
            let mut acc = acc_pre.borrow_mut();
            *acc = Some(match acc.take() {
                Some(prev) => op_pre(prev, item),
                None => item,
            });
        }),
        Box::new(move || {
            let local = acc.borrow_mut().take();
            let all: Vec<Option<T>> = flow.all_gather(&local)?;
            let mut global: Option<T> = None;
            // Strict rank order keeps non-associative-in-float operators
            // reproducible.
            for v in all.into_iter().flatten() {
                global = Some(match global {
                    Some(prev) => op(prev, v),
                    None => v,
                });
            }
            match (global, initial) {
                (Some(g), Some(i)) => Ok(op(i, g)),
                (Some(g), None) => Ok(g),
                (None, Some(i)) => Ok(i),
                (None, None) => Err(Error::Logic(format!("{label}() on an empty collection"))),
            }
        }),
        ErrorSlot::new(),
    )
}

/// Every worker receives all items, concatenated in rank order.
pub(crate) fn all_gather<T: Item>(dia: &Dia<T>) -> Result<Vec<T>> {
    let local: Rc<RefCell<Vec<T>>> = Rc::new(RefCell::new(Vec::new()));
    let flow = dia.ctx().flow();
    let l = Rc::clone(&local);
    run_action(
        dia,
        "all_gather",
        Box::new(move |item: T| l.borrow_mut().push(item)),
        Box::new(move || {
            let mine = std::mem::take(&mut *local.borrow_mut());
            let all: Vec<Vec<T>> = flow.all_gather(&mine)?;
            Ok(all.into_iter().flatten().collect())
        }),
        ErrorSlot::new(),
    )
}

/// Worker `target` receives everything; others an empty vector.
pub(crate) fn gather<T: Item>(dia: &Dia<T>, target: usize) -> Result<Vec<T>> {
    let ctx = dia.ctx().clone();
    if target >= ctx.num_workers() {
        return Err(Error::Config(format!(
            "gather target {target} out of range 0..{}",
            ctx.num_workers()
        )));
    }
    let mut gathered = all_gather(dia)?;
    if ctx.global_rank() != target {
        gathered.clear();
    }
    Ok(gathered)
}

/// Approximate distinct count of the collection.
pub(crate) fn hyperloglog<T: Item>(dia: &Dia<T>) -> Result<f64> {
    let sketch: Rc<RefCell<HyperLogLog>> = Rc::new(RefCell::new(HyperLogLog::new()));
    let flow = dia.ctx().flow();
    let err = ErrorSlot::new();
    let err_pre = err.clone();
    let s = Rc::clone(&sketch);
    run_action(
        dia,
        "hyperloglog",
        Box::new(move |item: T| {
            if let Err(e) = s.borrow_mut().add_item(&item) {
                err_pre.record(e.into());
            }
        }),
        Box::new(move || {
            let local = sketch.borrow().clone();
            let merged = flow.all_reduce(&local, ReduceOrder::Ordered, |mut a, b| {
                a.merge(&b);
                a
            })?;
            Ok(merged.count())
        }),
        err,
    )
}

/// Force execution of the chain without producing a value.
pub(crate) fn execute<T: Item>(dia: &Dia<T>) -> Result<()> {
    run_action(
        dia,
        "execute",
        Box::new(|_item: T| {}),
        Box::new(|| Ok(())),
        ErrorSlot::new(),
    )
}

/// Shared by the write actions in `io`: run an action whose execute step
/// needs the worker context.
pub(crate) fn run_write_action<T: Item, R: 'static>(
    dia: &Dia<T>,
    label: &'static str,
    preop: Box<dyn FnMut(T)>,
    exec: Box<dyn FnOnce() -> Result<R>>,
    err: ErrorSlot,
) -> Result<R> {
    run_action(dia, label, preop, exec, err)
}
