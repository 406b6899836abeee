//! Distributed sort.
//!
//! Three phases per worker. Sampling: the pre-op buffers items into a
//! local file while drawing a reservoir sample; samples and counts are
//! all-gathered and every worker derives the same `P-1` splitters.
//! Partition and shuffle: a first scan counts, per splitter boundary, the
//! items equal to the boundary key; a second collective makes the counts
//! global so ties can be balanced deterministically: tied items fill the
//! lower-ranked worker up to the target share of `ceil(N/P)` before moving to
//! higher ranks. The second scan routes every item to its range owner over
//! a shuffle. Local sort: the receiver runs the external
//! [`RunSorter`](crate::core::RunSorter); concatenating worker outputs in
//! rank order yields the globally sorted collection.

use crate::api::context::Context;
use crate::api::dia::{Dia, Item};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::common::NodeId;
use crate::core::sorter::{RunSorter, SortCmp};
use crate::data::file::FileSink;
use crate::data::stream::CatStream;
use crate::data::{BlockWriter, File};
use crate::error::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::debug;

// Identical on all workers: reproducible splitters up to data layout.
const SAMPLE_SEED: u64 = 0x5eed_5047;

pub(crate) struct Reservoir<T> {
    pub items: Vec<T>,
    pub seen: usize,
    cap: usize,
    rng: StdRng,
}

impl<T: Clone> Reservoir<T> {
    pub fn new(cap: usize, seed: u64) -> Self {
        Reservoir {
            items: Vec::new(),
            seen: 0,
            cap,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn add(&mut self, item: &T) {
        self.seen += 1;
        if self.items.len() < self.cap {
            self.items.push(item.clone());
        } else {
            let j = self.rng.gen_range(0..self.seen);
            if j < self.cap {
                self.items[j] = item.clone();
            }
        }
    }
}

struct SortPre<T> {
    writer: BlockWriter<FileSink>,
    reservoir: Reservoir<T>,
}

struct SortNode<T: Item> {
    base: NodeBase<T>,
    ctx: Context,
    stream: CatStream,
    pre: Rc<RefCell<SortPre<T>>>,
    local: File,
    out_file: File,
    cmp: SortCmp<T>,
    err: ErrorSlot,
}

impl<T: Item> NodeImpl for SortNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        {
            let mut pre = self.pre.borrow_mut();
            pre.writer.close()?;
        }
        let flow = self.ctx.flow();
        let workers = self.ctx.num_workers();
        let cmp = &self.cmp;

        // Phase 1: splitters from the all-gathered samples.
        let local_sample = std::mem::take(&mut self.pre.borrow_mut().reservoir.items);
        let gathered: Vec<(Vec<T>, usize)> =
            flow.all_gather(&(local_sample, self.local.num_items()))?;
        let total: usize = gathered.iter().map(|(_, n)| n).sum();
        let mut samples: Vec<T> = gathered.into_iter().flat_map(|(s, _)| s).collect();
        samples.sort_unstable_by(|a, b| cmp(a, b));
        let splitters: Vec<T> = if workers > 1 && !samples.is_empty() {
            (0..workers - 1)
                .map(|i| samples[(i + 1) * samples.len() / workers].clone())
                .collect()
        } else {
            Vec::new()
        };
        debug!(total, splitters = splitters.len(), "sort partitioning");

        // Phase 2a: count, per tied boundary range, the local items equal
        // to the boundary key, plus untied per-target counts.
        let mut base_counts = vec![0usize; workers];
        let mut tie_counts: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        {
            let mut reader = self.local.reader();
            while reader.has_next()? {
                let item: T = reader.next()?;
                let (lo, hi) = splitter_range(&splitters, &item, cmp);
                if lo == hi {
                    base_counts[lo] += 1;
                } else {
                    *tie_counts.entry((lo, hi)).or_default() += 1;
                }
            }
        }
        let tie_vec: Vec<((usize, usize), usize)> = tie_counts.iter().map(|(k, v)| (*k, *v)).collect();
        let all_counts: Vec<(Vec<usize>, Vec<((usize, usize), usize)>)> =
            flow.all_gather(&(base_counts, tie_vec))?;

        // Global untied load per target and, per boundary, the global tie
        // total and this worker's exclusive prefix.
        let my_rank = self.ctx.global_rank();
        let mut global_base = vec![0usize; workers];
        let mut tie_total: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        let mut tie_prefix: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        for (rank, (bases, ties)) in all_counts.iter().enumerate() {
            for (w, c) in bases.iter().enumerate() {
                global_base[w] += c;
            }
            for (range, c) in ties {
                *tie_total.entry(*range).or_default() += c;
                if rank < my_rank {
                    *tie_prefix.entry(*range).or_default() += c;
                }
            }
        }

        // Tied items fill the lower-ranked worker while it is below the
        // target share, then move to higher ranks.
        let share = total.div_ceil(workers.max(1)).max(1);
        let mut assigned = global_base.clone();
        let mut tie_cuts: BTreeMap<(usize, usize), Vec<(usize, usize)>> = BTreeMap::new();
        for (&(lo, hi), &count) in &tie_total {
            let mut remaining = count;
            let mut cuts = Vec::new();
            let mut cum = 0usize;
            for w in lo..=hi {
                let take = if w == hi {
                    remaining
                } else {
                    remaining.min(share.saturating_sub(assigned[w]))
                };
                assigned[w] += take;
                cum += take;
                remaining -= take;
                cuts.push((cum, w));
                if remaining == 0 {
                    break;
                }
            }
            tie_cuts.insert((lo, hi), cuts);
        }

        // Phase 2b: route every local item to its range owner.
        let mut writers = self.stream.open_writers()?;
        let mut tie_seen: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        {
            let mut reader = self.local.consume_reader();
            while reader.has_next()? {
                let item: T = reader.next()?;
                let (lo, hi) = splitter_range(&splitters, &item, cmp);
                let target = if lo == hi {
                    lo
                } else {
                    let seen = tie_seen.entry((lo, hi)).or_default();
                    let t = tie_prefix.get(&(lo, hi)).copied().unwrap_or(0) + *seen;
                    *seen += 1;
                    let cuts = &tie_cuts[&(lo, hi)];
                    cuts.iter()
                        .find(|(cum, _)| t < *cum)
                        .map_or(hi, |(_, w)| *w)
                };
                writers[target].put(&item)?;
            }
        }
        for writer in &mut writers {
            writer.close()?;
        }

        // Phase 3: local external sort of the received range.
        let mut sorter = RunSorter::new(
            self.ctx.pool().clone(),
            std::sync::Arc::clone(&self.cmp),
            self.ctx.config().sort_run_bytes,
        );
        let mut reader = self.stream.reader();
        while reader.has_next()? {
            sorter.push(reader.next()?)?;
        }
        let mut writer = self.out_file.writer(self.ctx.pool());
        sorter.finish(&mut |item| writer.put(&item))?;
        writer.close()
    }

    fn push_data_impl(&self, child: NodeId, consume: bool) -> Result<()> {
        self.base.push_file(&self.out_file, child, consume)
    }

    fn dispose_impl(&self) {
        self.out_file.clear();
    }
}

/// Targets an item may go to: `lo` is the first splitter not less than the
/// item, `hi` the first strictly greater. `lo == hi` means untied.
pub(crate) fn splitter_range<T>(
    splitters: &[T],
    item: &T,
    cmp: &SortCmp<T>,
) -> (usize, usize) {
    let lo = splitters.partition_point(|s| cmp(s, item) == Ordering::Less);
    let hi = splitters.partition_point(|s| cmp(s, item) != Ordering::Greater);
    (lo, hi)
}

pub(crate) fn sample_capacity(workers: usize) -> usize {
    (32 * workers).max(128)
}

pub(crate) fn sort<T: Item>(input: &Dia<T>, cmp: SortCmp<T>) -> Dia<T> {
    let ctx = input.ctx().clone();
    let stream = ctx.new_cat_stream().expect("allocate sort stream");
    let local = File::new();
    let pre = Rc::new(RefCell::new(SortPre {
        writer: local.writer(ctx.pool()),
        reservoir: Reservoir::new(sample_capacity(ctx.num_workers()), SAMPLE_SEED),
    }));

    let node = Rc::new(SortNode {
        base: NodeBase::new(ctx.new_node_id(), "sort", vec![input.node_rc()]),
        ctx: ctx.clone(),
        stream,
        pre: Rc::clone(&pre),
        local,
        out_file: File::new(),
        cmp,
        err: ErrorSlot::new(),
    });

    let err = node.err.clone();
    input.attach(
        node.base.id(),
        Box::new(move |item: T| {
            let mut pre = pre.borrow_mut();
            pre.reservoir.add(&item);
            if let Err(e) = pre.writer.put(&item) {
                err.record(e);
            }
        }),
    );
    Dia::from_node(ctx, node)
}
