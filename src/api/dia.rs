//! `Dia<T>`: the user-visible handle to a distributed collection.
//!
//! A `Dia` pairs a node of the worker-local DAG with the pending chain of
//! per-item transformations accumulated since the last forced operation.
//! `map`, `filter` and `flat_map` grow the chain without creating nodes;
//! the chain is collapsed into a single fused callback when a forcing
//! operation (shuffle, sort, cache, action) registers with the parent
//! node. The chain is represented directly as closure composition: each
//! stateless op wraps the downstream sink and hands the composite to the
//! attach function inherited from the node.
//!
//! Collections are lazy: nothing runs until an action is called. Actions
//! trigger the stage scheduler and return a plain value on every worker.

use crate::api::context::Context;
use crate::api::node::{AttachFn, DiaNode, NodeImpl};
use crate::api::{actions, cache, group, io, join, merge, prefix_sum, reduce, sample, sort, window, zip};
use crate::common::NodeId;
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;
use std::hash::Hash;
use std::rc::Rc;

/// Blanket bound for elements carried by a `Dia`.
///
/// Elements cross worker boundaries in serialized form and are buffered in
/// block files, so they must be owned, cloneable and serde-serializable.
pub trait Item: 'static + Clone + Send + Serialize + DeserializeOwned {}
impl<T> Item for T where T: 'static + Clone + Send + Serialize + DeserializeOwned {}

/// Additional bound for shuffle keys.
pub trait Key: Item + Hash + Eq {}
impl<T> Key for T where T: Item + Hash + Eq {}

/// A distributed immutable collection handle.
pub struct Dia<T: Item> {
    pub(crate) ctx: Context,
    pub(crate) node: Rc<dyn DiaNode>,
    pub(crate) attach_fn: AttachFn<T>,
}

impl<T: Item> Clone for Dia<T> {
    fn clone(&self) -> Self {
        Dia {
            ctx: self.ctx.clone(),
            node: Rc::clone(&self.node),
            attach_fn: Rc::clone(&self.attach_fn),
        }
    }
}

impl<T: Item> Dia<T> {
    pub(crate) fn from_node<N>(ctx: Context, node: Rc<N>) -> Self
    where
        N: NodeImpl<Out = T>,
    {
        let attach_fn = crate::api::node::identity_attach(&node);
        Dia {
            ctx,
            node,
            attach_fn,
        }
    }

    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn node_rc(&self) -> Rc<dyn DiaNode> {
        Rc::clone(&self.node)
    }

    /// Collapse the pending chain into a fused callback and register it on
    /// the node for `child`.
    pub(crate) fn attach(&self, child: NodeId, sink: Box<dyn FnMut(T)>) {
        (self.attach_fn)(child, sink);
    }

    // ------------------------------------------------------------------
    // Stateless chain ops (no new node)
    // ------------------------------------------------------------------

    /// Transform each item.
    pub fn map<U: Item>(&self, f: impl Fn(T) -> U + 'static) -> Dia<U> {
        let attach = Rc::clone(&self.attach_fn);
        let f = Rc::new(f);
        Dia {
            ctx: self.ctx.clone(),
            node: Rc::clone(&self.node),
            attach_fn: Rc::new(move |child, mut sink| {
                let f = Rc::clone(&f);
                attach(child, Box::new(move |item| sink(f(item))));
            }),
        }
    }

    /// Keep items matching the predicate.
    pub fn filter(&self, f: impl Fn(&T) -> bool + 'static) -> Dia<T> {
        let attach = Rc::clone(&self.attach_fn);
        let f = Rc::new(f);
        Dia {
            ctx: self.ctx.clone(),
            node: Rc::clone(&self.node),
            attach_fn: Rc::new(move |child, mut sink| {
                let f = Rc::clone(&f);
                attach(
                    child,
                    Box::new(move |item| {
                        if f(&item) {
                            sink(item);
                        }
                    }),
                );
            }),
        }
    }

    /// Transform each item into zero or more outputs.
    pub fn flat_map<U, I>(&self, f: impl Fn(T) -> I + 'static) -> Dia<U>
    where
        U: Item,
        I: IntoIterator<Item = U>,
    {
        let attach = Rc::clone(&self.attach_fn);
        let f = Rc::new(f);
        Dia {
            ctx: self.ctx.clone(),
            node: Rc::clone(&self.node),
            attach_fn: Rc::new(move |child, mut sink| {
                let f = Rc::clone(&f);
                attach(
                    child,
                    Box::new(move |item| {
                        for out in f(item) {
                            sink(out);
                        }
                    }),
                );
            }),
        }
    }

    // ------------------------------------------------------------------
    // Distributed ops (force the chain, create a node)
    // ------------------------------------------------------------------

    /// One output item per distinct key: the reduction of all items
    /// sharing that key. `reduce_fn` must be associative.
    pub fn reduce_by_key<K: Key>(
        &self,
        key_fn: impl Fn(&T) -> K + 'static,
        reduce_fn: impl Fn(T, T) -> T + 'static,
    ) -> Dia<T> {
        let key_fn = Rc::new(key_fn);
        reduce::reduce_node(
            self,
            "reduce_by_key",
            Rc::new(move |item: T| (key_fn(&item), item)),
            Rc::new(reduce_fn),
            Rc::new(|_k, v| v),
        )
    }

    /// Keyed reduction onto a dense index space `[0, size)`: item `i` of
    /// the output is the reduction of all items with index `i`, or
    /// `neutral` if none. Output is globally ordered by index.
    pub fn reduce_to_index(
        &self,
        index_fn: impl Fn(&T) -> usize + 'static,
        reduce_fn: impl Fn(T, T) -> T + 'static,
        size: usize,
        neutral: T,
    ) -> Dia<T> {
        reduce::reduce_to_index(self, Rc::new(index_fn), Rc::new(reduce_fn), size, neutral)
    }

    /// Collect all items sharing a key and fold them with `group_fn`.
    pub fn group_by_key<K: Key, U: Item>(
        &self,
        key_fn: impl Fn(&T) -> K + 'static,
        group_fn: impl Fn(K, Vec<T>) -> U + 'static,
    ) -> Dia<U> {
        group::group_by_key(self, Rc::new(key_fn), Rc::new(group_fn))
    }

    /// Grouping onto a dense index space; `group_fn` also sees empty
    /// groups. Output is globally ordered by index.
    pub fn group_to_index<U: Item>(
        &self,
        index_fn: impl Fn(&T) -> usize + 'static,
        group_fn: impl Fn(usize, Vec<T>) -> U + 'static,
        size: usize,
    ) -> Dia<U> {
        group::group_to_index(self, Rc::new(index_fn), Rc::new(group_fn), size)
    }

    /// Globally sort the collection.
    pub fn sort(&self, cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Dia<T> {
        sort::sort(self, std::sync::Arc::new(cmp))
    }

    /// Merge this sorted collection with another sorted collection into a
    /// globally sorted result.
    pub fn merge_with(
        &self,
        other: &Dia<T>,
        cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    ) -> Dia<T> {
        merge::merge(self, other, std::sync::Arc::new(cmp))
    }

    /// Pair this collection element-wise with `other`; both must have the
    /// same global size.
    pub fn zip<B: Item, U: Item>(
        &self,
        other: &Dia<B>,
        zip_fn: impl Fn(T, B) -> U + 'static,
    ) -> Dia<U> {
        zip::zip(self, other, Rc::new(zip_fn))
    }

    /// Sliding window of `k` consecutive items in global order; emits one
    /// output per window.
    pub fn window<U: Item>(&self, k: usize, f: impl Fn(&[T]) -> U + 'static) -> Dia<U> {
        window::window(self, k, Rc::new(f))
    }

    /// Sliding window emitting zero or more outputs per window.
    pub fn flat_window<U: Item>(
        &self,
        k: usize,
        f: impl Fn(&[T], &mut dyn FnMut(U)) + 'static,
    ) -> Dia<U> {
        window::flat_window(self, k, Rc::new(f))
    }

    /// Inclusive prefix sum in global order.
    pub fn prefix_sum(&self, op: impl Fn(T, T) -> T + 'static, initial: T) -> Dia<T> {
        prefix_sum::prefix_sum(self, Rc::new(op), initial, true)
    }

    /// Exclusive prefix sum in global order.
    pub fn ex_prefix_sum(&self, op: impl Fn(T, T) -> T + 'static, initial: T) -> Dia<T> {
        prefix_sum::prefix_sum(self, Rc::new(op), initial, false)
    }

    /// Hash join with `other` on matching keys.
    pub fn inner_join_with<B: Item, K: Key, U: Item>(
        &self,
        other: &Dia<B>,
        key_fn: impl Fn(&T) -> K + 'static,
        other_key_fn: impl Fn(&B) -> K + 'static,
        join_fn: impl Fn(T, B) -> U + 'static,
    ) -> Dia<U> {
        join::inner_join(
            self,
            other,
            Rc::new(key_fn),
            Rc::new(other_key_fn),
            Rc::new(join_fn),
        )
    }

    /// A uniform random sample of `k` items (all items when the
    /// collection holds fewer).
    pub fn sample(&self, k: usize) -> Dia<T> {
        sample::sample(self, k)
    }

    /// Materialize the collection so it can be read by several actions.
    pub fn cache(&self) -> Dia<T> {
        cache::cache(self, "cache")
    }

    /// Fold the pending chain into a materialized node without changing
    /// the element type, so the handle can be stored and re-used.
    pub fn collapse(&self) -> Dia<T> {
        cache::cache(self, "collapse")
    }

    // ------------------------------------------------------------------
    // Actions (trigger execution, return a value)
    // ------------------------------------------------------------------

    /// Number of items in the collection.
    pub fn size(&self) -> Result<usize> {
        actions::size(self)
    }

    /// Fold all items with `op`, starting from `initial`.
    pub fn sum_with(&self, op: impl Fn(T, T) -> T + 'static, initial: T) -> Result<T> {
        actions::fold(self, "sum", Rc::new(op), Some(initial))
    }

    /// Sum of all items.
    pub fn sum(&self) -> Result<T>
    where
        T: std::ops::Add<Output = T> + Default,
    {
        actions::fold(self, "sum", Rc::new(|a: T, b: T| a + b), Some(T::default()))
    }

    /// Smallest item; fails on an empty collection.
    pub fn min(&self) -> Result<T>
    where
        T: Ord,
    {
        actions::fold(self, "min", Rc::new(|a: T, b: T| a.min(b)), None)
    }

    /// Largest item; fails on an empty collection.
    pub fn max(&self) -> Result<T>
    where
        T: Ord,
    {
        actions::fold(self, "max", Rc::new(|a: T, b: T| a.max(b)), None)
    }

    /// Every worker receives all items, concatenated in worker-rank
    /// order.
    pub fn all_gather(&self) -> Result<Vec<T>> {
        actions::all_gather(self)
    }

    /// Worker `target` receives all items; other workers get an empty
    /// vector.
    pub fn gather(&self, target: usize) -> Result<Vec<T>> {
        actions::gather(self, target)
    }

    /// Approximate distinct count via a HyperLogLog sketch.
    pub fn hyperloglog(&self) -> Result<f64> {
        actions::hyperloglog(self)
    }

    /// Force execution without producing a value.
    pub fn execute(&self) -> Result<()> {
        actions::execute(self)
    }

    /// Write each worker's items as lines into one file per worker,
    /// derived from `pattern`.
    pub fn write_lines_many(&self, pattern: &str) -> Result<()>
    where
        T: AsRef<str>,
    {
        io::write_lines_many(self, pattern)
    }

    /// Write all items as lines into a single file, in global order.
    pub fn write_lines(&self, path: &str) -> Result<()>
    where
        T: AsRef<str>,
    {
        io::write_lines(self, path)
    }

    /// Write the items in the engine's binary block layout, one file per
    /// worker; [`read_binary`](crate::read_binary) reads them back.
    pub fn write_binary(&self, pattern: &str) -> Result<()> {
        io::write_binary(self, pattern)
    }
}

impl<K: Key, V: Item> Dia<(K, V)> {
    /// Reduce the values of each key with `reduce_fn`; one pair per
    /// distinct key.
    pub fn reduce_pair(&self, reduce_fn: impl Fn(V, V) -> V + 'static) -> Dia<(K, V)> {
        reduce::reduce_node(
            self,
            "reduce_pair",
            Rc::new(|(k, v): (K, V)| (k, v)),
            Rc::new(reduce_fn),
            Rc::new(|k, v| (k, v)),
        )
    }
}
