//! DAG lifecycle semantics: laziness, caching, collapse, and the
//! use-after-consume error.

use millrace::testing::{assert_collections_equal, run_local_test};
use millrace::{generate, generate_with, Error};

#[test]
fn stateless_chain_fuses_without_materializing() {
    run_local_test(|ctx| {
        let out = generate(ctx, 100)
            .map(|i| i * 3)
            .filter(|v| v % 2 == 0)
            .flat_map(|v| vec![v, v])
            .size()?;
        // 50 even multiples of three, duplicated.
        assert_eq!(out, 100);
        Ok(())
    });
}

#[test]
fn cached_collections_survive_multiple_actions() {
    run_local_test(|ctx| {
        let sorted = generate_with(ctx, 200, |i| (199 - i) as u64)
            .sort(|a, b| a.cmp(b))
            .cache();
        assert_eq!(sorted.size()?, 200);
        assert_eq!(sorted.size()?, 200);
        let out = sorted.all_gather()?;
        assert_collections_equal(&out, &(0..200u64).collect::<Vec<_>>());
        Ok(())
    });
}

#[test]
fn collapse_erases_the_pending_chain() {
    run_local_test(|ctx| {
        let mut current = generate(ctx, 10).map(|i| i as u64).collapse();
        for _ in 0..3 {
            current = current.map(|v| v + 1).collapse();
        }
        let out = current.all_gather()?;
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert_collections_equal(&sorted, &(3..13u64).collect::<Vec<_>>());
        Ok(())
    });
}

#[test]
fn reading_a_consumed_collection_fails() {
    millrace::run_local(1, 2, |ctx| {
        let sorted = generate(ctx, 50).map(|i| i as u64).sort(|a, b| a.cmp(b));
        assert_eq!(sorted.size()?, 50);

        // The sort node was consumed by the first action; a second one
        // must fail rather than return a wrong value.
        match sorted.size() {
            Err(Error::Worker { source, .. }) => {
                assert!(matches!(*source, Error::Logic(_)));
            }
            Err(Error::Logic(_)) => {}
            other => panic!("expected a logic error, got {other:?}"),
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn shared_parent_feeds_several_children() {
    run_local_test(|ctx| {
        let base = generate(ctx, 30).map(|i| i as u64).cache();
        let doubled = base.map(|v| v * 2);
        let halved = base.filter(|v| v % 2 == 0);
        assert_eq!(doubled.sum()?, (0..30u64).map(|v| v * 2).sum());
        assert_eq!(halved.size()?, 15);
        Ok(())
    });
}
