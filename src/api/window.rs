//! Sliding windows over the global item order.
//!
//! A window of size `k` covers `k` consecutive items; one window ends at
//! every item with global index `>= k-1`, and the worker owning that item
//! emits its output. The boundary context (up to `k-1` items preceding a
//! worker's range) is reconstructed from an all-gather of each worker's
//! tail items, so no dedicated shuffle is needed; window sizes are assumed
//! small against the per-worker data.

use crate::api::context::Context;
use crate::api::dia::{Dia, Item};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::NodeId;
use crate::data::file::FileSink;
use crate::data::{BlockWriter, File};
use crate::error::Result;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

enum WindowFn<T, Out> {
    /// One output per window.
    Map(Rc<dyn Fn(&[T]) -> Out>),
    /// Zero or more outputs per window.
    Flat(Rc<dyn Fn(&[T], &mut dyn FnMut(Out))>),
}

struct WindowNode<T: Item, Out: Item> {
    base: NodeBase<Out>,
    ctx: Context,
    k: usize,
    pre: Rc<RefCell<BlockWriter<FileSink>>>,
    local: File,
    prelude: RefCell<Vec<T>>,
    window_fn: WindowFn<T, Out>,
    err: ErrorSlot,
}

impl<T: Item, Out: Item> NodeImpl for WindowNode<T, Out> {
    type Out = Out;

    fn base(&self) -> &NodeBase<Out> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        self.pre.borrow_mut().close()?;

        // Collect this worker's tail (up to k-1 last items) and exchange
        // tails; the context preceding our range is assembled from the
        // tails of lower-ranked workers, nearest first.
        let keep = self.k.saturating_sub(1);
        let mut tail: VecDeque<T> = VecDeque::with_capacity(keep + 1);
        {
            let mut reader = self.local.reader();
            while reader.has_next()? {
                tail.push_back(reader.next()?);
                if tail.len() > keep {
                    tail.pop_front();
                }
            }
        }
        let tails: Vec<Vec<T>> = self.ctx.flow().all_gather(&Vec::from(tail))?;

        let mut prelude: VecDeque<T> = VecDeque::with_capacity(keep);
        for rank in (0..self.ctx.global_rank()).rev() {
            for item in tails[rank].iter().rev() {
                if prelude.len() == keep {
                    break;
                }
                prelude.push_front(item.clone());
            }
            if prelude.len() == keep {
                break;
            }
        }
        *self.prelude.borrow_mut() = prelude.into();
        Ok(())
    }

    fn push_data_impl(&self, child: NodeId, consume: bool) -> Result<()> {
        self.base.push_with(child, |emit| {
            let mut window: VecDeque<T> = self.prelude.borrow().iter().cloned().collect();
            let mut reader = self.local.reader_dyn(consume);
            let mut scratch: Vec<T> = Vec::with_capacity(self.k);
            while reader.has_next()? {
                window.push_back(reader.next()?);
                if window.len() > self.k {
                    window.pop_front();
                }
                if window.len() == self.k {
                    scratch.clear();
                    scratch.extend(window.iter().cloned());
                    match &self.window_fn {
                        WindowFn::Map(f) => emit(f(&scratch)),
                        WindowFn::Flat(f) => f(&scratch, &mut *emit),
                    }
                }
            }
            Ok(())
        })
    }

    fn dispose_impl(&self) {
        self.local.clear();
        self.prelude.borrow_mut().clear();
    }
}

fn window_node<T: Item, Out: Item>(
    input: &Dia<T>,
    k: usize,
    window_fn: WindowFn<T, Out>,
) -> Dia<Out> {
    assert!(k > 0, "window size must be positive");
    let ctx = input.ctx().clone();
    let local = File::new();
    let pre = Rc::new(RefCell::new(local.writer(ctx.pool())));

    let node = Rc::new(WindowNode {
        base: NodeBase::new(ctx.new_node_id(), "window", vec![input.node_rc()]),
        ctx: ctx.clone(),
        k,
        pre: Rc::clone(&pre),
        local,
        prelude: RefCell::new(Vec::new()),
        window_fn,
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

pub(crate) fn window<T: Item, Out: Item>(
    input: &Dia<T>,
    k: usize,
    f: Rc<dyn Fn(&[T]) -> Out>,
) -> Dia<Out> {
    window_node(input, k, WindowFn::Map(f))
}

pub(crate) fn flat_window<T: Item, Out: Item>(
    input: &Dia<T>,
    k: usize,
    f: Rc<dyn Fn(&[T], &mut dyn FnMut(Out))>,
) -> Dia<Out> {
    window_node(input, k, WindowFn::Flat(f))
}
