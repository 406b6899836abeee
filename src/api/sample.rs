//! Uniform random sample of fixed global size.
//!
//! Each worker keeps a local reservoir of up to `k` items. A collective
//! gathers the local counts; the sample is then apportioned to workers
//! proportionally to their item counts with deterministic largest-
//! remainder rounding, and every worker emits that many items from its
//! reservoir. No items move between workers. When the collection holds at
//! most `k` items, the sample is the whole collection.

use crate::api::context::Context;
use crate::api::dia::{Dia, Item};
use crate::api::node::{ErrorSlot, NodeBase, NodeImpl};
use crate::api::sort::Reservoir;
use crate::common::NodeId;
use crate::data::File;
use crate::error::Result;
use std::cell::RefCell;
use std::rc::Rc;

const SAMPLE_SEED: u64 = 0x5a6d_706c;

struct SampleNode<T: Item> {
    base: NodeBase<T>,
    ctx: Context,
    k: usize,
    pre: Rc<RefCell<Reservoir<T>>>,
    out_file: File,
    err: ErrorSlot,
}

impl<T: Item> NodeImpl for SampleNode<T> {
    type Out = T;

    fn base(&self) -> &NodeBase<T> {
        &self.base
    }

    fn execute_impl(&self) -> Result<()> {
        self.err.take()?;
        let (mut reservoir, local_n) = {
            let mut pre = self.pre.borrow_mut();
            (std::mem::take(&mut pre.items), pre.seen)
        };
        let counts: Vec<usize> = self.ctx.flow().all_gather(&local_n)?;
        let shares = apportion(&counts, self.k);
        let my_share = shares[self.ctx.global_rank()].min(reservoir.len());

        let mut writer = self.out_file.writer(self.ctx.pool());
        for item in reservoir.drain(..my_share) {
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

/// Split a sample budget of `k` over workers proportionally to their item
/// counts. Deterministic: floor shares first, then the remainder is dealt
/// in rank order to workers with spare items.
fn apportion(counts: &[usize], k: usize) -> Vec<usize> {
    let total: usize = counts.iter().sum();
    if total <= k {
        return counts.to_vec();
    }
    let mut shares: Vec<usize> = counts.iter().map(|&n| k * n / total).collect();
    let mut remainder = k - shares.iter().sum::<usize>();
    while remainder > 0 {
        let mut progressed = false;
        for (share, &n) in shares.iter_mut().zip(counts) {
            if remainder == 0 {
                break;
            }
            if *share < n {
                *share += 1;
                remainder -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    shares
}

pub(crate) fn sample<T: Item>(input: &Dia<T>, k: usize) -> Dia<T> {
    let ctx = input.ctx().clone();
    let pre = Rc::new(RefCell::new(Reservoir::new(
        k,
        SAMPLE_SEED ^ ctx.global_rank() as u64,
    )));

    let node = Rc::new(SampleNode {
        base: NodeBase::new(ctx.new_node_id(), "sample", vec![input.node_rc()]),
        ctx: ctx.clone(),
        k,
        pre: Rc::clone(&pre),
        out_file: File::new(),
        err: ErrorSlot::new(),
    });

    input.attach(
        node.base.id(),
        Box::new(move |item: T| {
            pre.borrow_mut().add(&item);
        }),
    );
    Dia::from_node(ctx, node)
}

#[cfg(test)]
mod tests {
    use super::apportion;

    #[test]
    fn apportion_sums_to_budget() {
        let shares = apportion(&[10, 0, 5, 85], 20);
        assert_eq!(shares.iter().sum::<usize>(), 20);
        assert_eq!(shares[1], 0);
    }

    #[test]
    fn apportion_small_collections_keep_everything() {
        assert_eq!(apportion(&[3, 2], 10), vec![3, 2]);
    }
}
