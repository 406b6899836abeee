//! Merge of two sorted collections into a globally sorted one.
//!
//! Both inputs are buffered locally while sampled; splitters derived from
//! the combined samples partition the key space. Each worker routes both
//! of its buffered inputs to the range owners *in input order*, so every
//! `(sender, input)` sequence arrives at its receiver already sorted; the
//! receiver then k-way merges those `2*P` sorted sequences.

use crate::api::dia::{Dia, Item};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::api::sort::{sample_capacity, splitter_range, Reservoir};
use crate::common::NodeId;
use crate::core::sorter::SortCmp;
use crate::data::file::FileSink;
use crate::data::stream::CatStream;
use crate::data::{BlockWriter, File};
use crate::error::Result;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

const MERGE_SEED: u64 = 0x6d65_7267;

struct MergePre<T> {
    writer: BlockWriter<FileSink>,
    reservoir: Reservoir<T>,
}

struct MergeNode<T: Item> {
    base: NodeBase<T>,
    ctx: crate::api::context::Context,
    streams: [CatStream; 2],
    pres: [Rc<RefCell<MergePre<T>>>; 2],
    locals: [File; 2],
    out_file: File,
    cmp: SortCmp<T>,
    err: ErrorSlot,
}

impl<T: Item> NodeImpl for MergeNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        let flow = self.ctx.flow();
        let workers = self.ctx.num_workers();
        let cmp = &self.cmp;

        let mut local_samples: Vec<T> = Vec::new();
        for pre in &self.pres {
            let mut pre = pre.borrow_mut();
            pre.writer.close()?;
            local_samples.append(&mut pre.reservoir.items);
        }
        let gathered: Vec<Vec<T>> = flow.all_gather(&local_samples)?;
        let mut samples: Vec<T> = gathered.into_iter().flatten().collect();
        samples.sort_unstable_by(|a, b| cmp(a, b));
        let splitters: Vec<T> = if workers > 1 && !samples.is_empty() {
            (0..workers - 1)
                .map(|i| samples[(i + 1) * samples.len() / workers].clone())
                .collect()
        } else {
            Vec::new()
        };

        // Route both inputs in order; ties all go to the lower range so
        // per-sender sequences stay sorted.
        for (local, stream) in self.locals.iter().zip(&self.streams) {
            let mut writers = stream.open_writers()?;
            let mut reader = local.consume_reader();
            while reader.has_next()? {
                let item: T = reader.next()?;
                let (lo, _hi) = splitter_range(&splitters, &item, cmp);
                writers[lo].put(&item)?;
            }
            for writer in &mut writers {
                writer.close()?;
            }
        }

        // K-way merge over the per-sender sorted sequences of both
        // streams.
        let mut readers: Vec<_> = self
            .streams
            .iter()
            .flat_map(CatStream::per_sender_readers)
            .collect();
        let mut heads: Vec<Option<T>> = Vec::with_capacity(readers.len());
        for reader in &mut readers {
            heads.push(if reader.has_next()? {
                Some(reader.next()?)
            } else {
                None
            });
        }
        let mut writer = self.out_file.writer(self.ctx.pool());
        loop {
            let mut min_idx: Option<usize> = None;
            for (i, head) in heads.iter().enumerate() {
                if let Some(h) = head {
                    let better = match min_idx {
                        None => true,
                        Some(m) => {
                            cmp(h, heads[m].as_ref().expect("tracked head")) == Ordering::Less
                        }
                    };
                    if better {
                        min_idx = Some(i);
                    }
                }
            }
            let Some(i) = min_idx else { break };
            let item = heads[i].take().expect("selected head");
            heads[i] = if readers[i].has_next()? {
                Some(readers[i].next()?)
            } else {
                None
            };
            writer.put(&item)?;
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

pub(crate) fn merge<T: Item>(a: &Dia<T>, b: &Dia<T>, cmp: SortCmp<T>) -> Dia<T> {
    let ctx = a.ctx().clone();
    let streams = [
        ctx.new_cat_stream().expect("allocate merge stream"),
        ctx.new_cat_stream().expect("allocate merge stream"),
    ];
    let locals = [File::new(), File::new()];
    let cap = sample_capacity(ctx.num_workers());
    let pres = [
        Rc::new(RefCell::new(MergePre {
            writer: locals[0].writer(ctx.pool()),
            reservoir: Reservoir::new(cap, MERGE_SEED),
        })),
        Rc::new(RefCell::new(MergePre {
            writer: locals[1].writer(ctx.pool()),
            reservoir: Reservoir::new(cap, MERGE_SEED),
        })),
    ];

    let node = Rc::new(MergeNode {
        base: NodeBase::new(
            ctx.new_node_id(),
            "merge",
            vec![a.node_rc(), b.node_rc()],
        ),
        ctx: ctx.clone(),
        streams,
        pres: [Rc::clone(&pres[0]), Rc::clone(&pres[1])],
        locals,
        out_file: File::new(),
        cmp,
        err: ErrorSlot::new(),
    });

    for (dia_side, pre) in [(0, &pres[0]), (1, &pres[1])] {
        let pre = Rc::clone(pre);
        let err = node.err.clone();
        let sink = Box::new(move |item: T| {
            let mut pre = pre.borrow_mut();
            pre.reservoir.add(&item);
            if let Err(e) = pre.writer.put(&item) {
                err.record(e);
            }
        });
        if dia_side == 0 {
            a.attach(node.base.id(), sink);
        } else {
            b.attach(node.base.id(), sink);
        }
    }
    Dia::from_node(ctx, node)
}
