//! Collective primitive tests across worker-group topologies.

use millrace::testing::run_local_test;
use millrace::ReduceOrder;

#[test]
fn barrier_and_broadcast() {
    run_local_test(|ctx| {
        let flow = ctx.flow();
        flow.barrier()?;
        let value = ctx.global_rank() as u64 * 10;
        let from_root = flow.broadcast(&value, 0)?;
        assert_eq!(from_root, 0);
        let last = ctx.num_workers() - 1;
        let from_last = flow.broadcast(&value, last)?;
        assert_eq!(from_last, last as u64 * 10);
        Ok(())
    });
}

#[test]
fn all_gather_returns_rank_ordered_vector() {
    run_local_test(|ctx| {
        let flow = ctx.flow();
        let gathered: Vec<usize> = flow.all_gather(&ctx.global_rank())?;
        let expected: Vec<usize> = (0..ctx.num_workers()).collect();
        assert_eq!(gathered, expected);
        Ok(())
    });
}

#[test]
fn all_reduce_ordered_and_tree_agree_for_associative_ops() {
    run_local_test(|ctx| {
        let flow = ctx.flow();
        let v = ctx.global_rank() as u64 + 1;
        let ordered = flow.all_reduce(&v, ReduceOrder::Ordered, |a, b| a + b)?;
        let tree = flow.all_reduce(&v, ReduceOrder::Tree, |a, b| a + b)?;
        let p = ctx.num_workers() as u64;
        assert_eq!(ordered, p * (p + 1) / 2);
        assert_eq!(tree, ordered);
        Ok(())
    });
}

#[test]
fn prefix_sum_inclusive_and_exclusive() {
    run_local_test(|ctx| {
        let flow = ctx.flow();
        let v = ctx.global_rank() as u64 + 1;
        let inclusive = flow.prefix_sum(&v, 100, true, |a, b| a + b)?;
        let exclusive = flow.prefix_sum(&v, 100, false, |a, b| a + b)?;
        let k = ctx.global_rank() as u64;
        assert_eq!(inclusive, 100 + (k + 1) * (k + 2) / 2);
        assert_eq!(exclusive, 100 + k * (k + 1) / 2);
        Ok(())
    });
}

#[test]
fn collectives_in_sequence_do_not_interfere() {
    run_local_test(|ctx| {
        let flow = ctx.flow();
        for round in 0..20u64 {
            let sum = flow.all_reduce(&round, ReduceOrder::Ordered, |a, b| a + b)?;
            assert_eq!(sum, round * ctx.num_workers() as u64);
        }
        Ok(())
    });
}
