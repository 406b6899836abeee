//! Source operators: the roots of a dataflow graph.
//!
//! Pure sources (`generate`, `equal_to_dia`, `distribute`,
//! `concat_to_dia`) hold or compute their data locally and replay it on
//! every push, so they survive multiple actions. `distribute_from`
//! scatters one worker's vector across the group through a shuffle.

use crate::api::context::Context;
use crate::api::dia::{Dia, Item};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::{local_range, NodeId, Range};
use crate::data::stream::CatStream;
use crate::data::File;
use crate::error::Result;
use std::rc::Rc;

/// A lazily generated integer range source.
struct GenerateNode<T: Item> {
    base: NodeBase<T>,
    generator: Rc<dyn Fn(usize) -> T>,
    range: Range,
}

impl<T: Item> NodeImpl for GenerateNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        Ok(())
    }

    fn push_data_impl(&self, child: NodeId, _consume: bool) -> Result<()> {
        self.base.push_with(child, |emit| {
            for i in self.range.begin..self.range.end {
                emit((self.generator)(i));
            }
            Ok(())
        })
    }

    fn keep(&self) -> bool {
        // Regenerated on demand; never holds storage worth disposing.
        true
    }
}

/// The indexes `0..n`, balanced across workers.
pub fn generate(ctx: &Context, n: usize) -> Dia<usize> {
    generate_with(ctx, n, |i| i)
}

/// `f(0), .., f(n-1)`, balanced across workers; worker `r` computes its
/// contiguous index slice.
pub fn generate_with<T: Item>(
    ctx: &Context,
    n: usize,
    f: impl Fn(usize) -> T + 'static,
) -> Dia<T> {
    let node = Rc::new(GenerateNode {
        base: NodeBase::new(ctx.new_node_id(), "generate", vec![]),
        generator: Rc::new(f),
        range: local_range(n, ctx.num_workers(), ctx.global_rank()),
    });
    Dia::from_node(ctx.clone(), node)
}

/// Source over a vector each worker already holds.
struct VecSourceNode<T: Item> {
    base: NodeBase<T>,
    items: Vec<T>,
    range: Range,
}

impl<T: Item> NodeImpl for VecSourceNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        Ok(())
    }

    fn push_data_impl(&self, child: NodeId, _consume: bool) -> Result<()> {
        self.base.push_with(child, |emit| {
            for item in &self.items[self.range.begin..self.range.end] {
                emit(item.clone());
            }
            Ok(())
        })
    }

    fn keep(&self) -> bool {
        true
    }
}

fn vec_source<T: Item>(ctx: &Context, label: &'static str, items: Vec<T>, range: Range) -> Dia<T> {
    let node = Rc::new(VecSourceNode {
        base: NodeBase::new(ctx.new_node_id(), label, vec![]),
        items,
        range,
    });
    Dia::from_node(ctx.clone(), node)
}

/// Wrap a vector that is EQUAL on all workers into a DIA: worker `r`
/// contributes its balanced slice.
pub fn equal_to_dia<T: Item>(ctx: &Context, items: Vec<T>) -> Dia<T> {
    let range = local_range(items.len(), ctx.num_workers(), ctx.global_rank());
    vec_source(ctx, "equal_to_dia", items, range)
}

/// Same contract as [`equal_to_dia`]: the vector must be equal on all
/// workers. Use [`distribute_from`] to scatter data only one worker holds.
pub fn distribute<T: Item>(ctx: &Context, items: Vec<T>) -> Dia<T> {
    let range = local_range(items.len(), ctx.num_workers(), ctx.global_rank());
    vec_source(ctx, "distribute", items, range)
}

/// Concatenate each worker's local vector, in worker-rank order.
pub fn concat_to_dia<T: Item>(ctx: &Context, items: Vec<T>) -> Dia<T> {
    let range = Range {
        begin: 0,
        end: items.len(),
    };
    vec_source(ctx, "concat_to_dia", items, range)
}

/// Scatter of one worker's vector over a shuffle.
struct DistributeFromNode<T: Item> {
    base: NodeBase<T>,
    ctx: Context,
    stream: CatStream,
    items: Vec<T>,
    source: usize,
    out_file: File,
    err: ErrorSlot,
}

impl<T: Item> NodeImpl for DistributeFromNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        let workers = self.ctx.num_workers();
        let mut writers = self.stream.open_writers()?;
        if self.ctx.global_rank() == self.source {
            for (w, writer) in writers.iter_mut().enumerate() {
                let range = local_range(self.items.len(), workers, w);
                for item in &self.items[range.begin..range.end] {
                    writer.put(item)?;
                }
            }
        }
        for writer in &mut writers {
            writer.close()?;
        }
        let mut out = self.out_file.writer(self.ctx.pool());
        let mut reader = self.stream.reader();
        while reader.has_next()? {
            out.put(&reader.next::<T>()?)?;
        }
        out.close()
    }

    fn push_data_impl(&self, child: NodeId, consume: bool) -> Result<()> {
        self.base.push_file(&self.out_file, child, consume)
    }

    fn dispose_impl(&self) {
        self.out_file.clear();
    }
}

/// Scatter `source`'s vector across the group in balanced slices; the
/// vectors of other workers are ignored.
pub fn distribute_from<T: Item>(ctx: &Context, items: Vec<T>, source: usize) -> Dia<T> {
    let stream = ctx.new_cat_stream().expect("allocate scatter stream");
    let node = Rc::new(DistributeFromNode {
        base: NodeBase::new(ctx.new_node_id(), "distribute_from", vec![]),
        ctx: ctx.clone(),
        stream,
        items,
        source,
        out_file: File::new(),
        err: ErrorSlot::new(),
    });
    Dia::from_node(ctx.clone(), node)
}
