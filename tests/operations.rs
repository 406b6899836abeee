//! Operator semantics: prefix sums, scalar actions, keyed reductions and
//! groupings.

use millrace::testing::{assert_collections_equal, assert_kv_collections_equal, run_local_test};
use millrace::{generate, generate_with};

#[test]
fn prefix_sum_of_one_to_ten() {
    // Generate [1..10]; the inclusive prefix sums are the triangular
    // numbers and the scalar actions agree.
    millrace::run_local(1, 4, |ctx| {
        let numbers = generate_with(ctx, 10, |i| (i + 1) as u64);
        let sums = numbers.prefix_sum(|a, b| a + b, 0);
        let out = sums.all_gather()?;
        assert_collections_equal(&out, &[1, 3, 6, 10, 15, 21, 28, 36, 45, 55]);

        let numbers = generate_with(ctx, 10, |i| (i + 1) as u64);
        assert_eq!(numbers.size()?, 10);
        assert_eq!(numbers.sum()?, 55);
        assert_eq!(numbers.min()?, 1);
        assert_eq!(numbers.max()?, 10);
        Ok(())
    })
    .unwrap();
}

#[test]
fn exclusive_prefix_sum() {
    run_local_test(|ctx| {
        let numbers = generate_with(ctx, 5, |i| (i + 1) as u64);
        let out = numbers.ex_prefix_sum(|a, b| a + b, 0).all_gather()?;
        assert_collections_equal(&out, &[0, 1, 3, 6, 10]);
        Ok(())
    });
}

#[test]
fn sum_with_initial_and_empty_collections() {
    run_local_test(|ctx| {
        let empty = generate(ctx, 0);
        assert_eq!(empty.size()?, 0);
        assert_eq!(empty.clone().sum_with(|a, b| a + b, 7)?, 7);
        assert!(empty.min().is_err());
        Ok(())
    });
}

#[test]
fn reduce_by_key_sums_per_key() {
    run_local_test(|ctx| {
        // 100 values keyed mod 7; reduce keeps the key in the pair.
        let pairs = generate(ctx, 100).map(|i| ((i % 7) as u32, i as u64));
        let reduced = pairs.reduce_by_key(|p| p.0, |a, b| (a.0, a.1 + b.1));
        let out = reduced.all_gather()?;

        let mut expected = vec![(0u32, 0u64); 7];
        for (k, e) in expected.iter_mut().enumerate() {
            e.0 = k as u32;
            e.1 = (0..100u64).filter(|i| i % 7 == k as u64).sum();
        }
        assert_kv_collections_equal(out, expected);
        Ok(())
    });
}

#[test]
fn reduce_pair_over_key_value_pairs() {
    run_local_test(|ctx| {
        let pairs = generate(ctx, 60).map(|i| ((i % 3) as u8, 1u64));
        let out = pairs.reduce_pair(|a, b| a + b).all_gather()?;
        assert_kv_collections_equal(out, vec![(0u8, 20u64), (1, 20), (2, 20)]);
        Ok(())
    });
}

#[test]
fn reduce_to_index_is_dense_and_ordered() {
    run_local_test(|ctx| {
        let values = generate(ctx, 20).map(|i| i as u64);
        let out = values
            .reduce_to_index(|v| (v % 5) as usize, |a, b| a + b, 5, 0)
            .all_gather()?;
        let expected: Vec<u64> = (0..5u64)
            .map(|k| (0..20).filter(|i| i % 5 == k).sum())
            .collect();
        assert_collections_equal(&out, &expected);
        Ok(())
    });
}

#[test]
fn reduce_to_index_emits_neutral_for_gaps() {
    run_local_test(|ctx| {
        let values = generate(ctx, 4).map(|i| (i * 2) as u64);
        // Only even indexes below 8 are hit.
        let out = values
            .reduce_to_index(|v| *v as usize, |a, b| a + b, 8, 999)
            .all_gather()?;
        assert_collections_equal(&out, &[0, 999, 2, 999, 4, 999, 6, 999]);
        Ok(())
    });
}

#[test]
fn group_by_key_collects_full_groups() {
    run_local_test(|ctx| {
        let values = generate(ctx, 30);
        let out = values
            .group_by_key(
                |v| (v % 4) as u32,
                |k, vs| (k, vs.len(), vs.iter().sum::<usize>()),
            )
            .all_gather()?;
        let mut got: Vec<(u32, (usize, usize))> =
            out.into_iter().map(|(k, n, s)| (k, (n, s))).collect();
        got.sort();
        let expected: Vec<(u32, (usize, usize))> = (0..4u32)
            .map(|k| {
                let members: Vec<usize> =
                    (0..30usize).filter(|v| v % 4 == k as usize).collect();
                (k, (members.len(), members.iter().sum()))
            })
            .collect();
        assert_eq!(got, expected);
        Ok(())
    });
}

#[test]
fn group_to_index_sees_empty_groups() {
    run_local_test(|ctx| {
        let values = generate(ctx, 10).filter(|v| *v < 5);
        let out = values
            .group_to_index(|v| *v, |idx, vs| (idx, vs.len()), 8)
            .all_gather()?;
        let expected: Vec<(usize, usize)> = (0..8)
            .map(|idx| (idx, usize::from(idx < 5)))
            .collect();
        assert_collections_equal(&out, &expected);
        Ok(())
    });
}

#[test]
fn hyperloglog_estimates_distinct_count() {
    run_local_test(|ctx| {
        // 10_000 distinct values, each occurring twice.
        let values = generate(ctx, 20_000).map(|i| (i % 10_000) as u64);
        let estimate = values.hyperloglog()?;
        let error = (estimate - 10_000.0).abs() / 10_000.0;
        assert!(error < 0.05, "estimate {estimate} off by {error}");
        Ok(())
    });
}

#[test]
fn sample_returns_k_distinct_input_items() {
    run_local_test(|ctx| {
        let values = generate(ctx, 500);
        let sampled = values.sample(20).all_gather()?;
        assert_eq!(sampled.len(), 20);
        let mut seen = std::collections::HashSet::new();
        for v in sampled {
            assert!(v < 500);
            assert!(seen.insert(v));
        }

        // Sampling more than the collection holds returns everything.
        let small = generate(ctx, 7);
        assert_eq!(small.sample(100).size()?, 7);
        Ok(())
    });
}

#[test]
fn gather_concentrates_on_one_worker() {
    run_local_test(|ctx| {
        let values = generate(ctx, 40);
        let target = ctx.num_workers() - 1;
        let gathered = values.gather(target)?;
        if ctx.global_rank() == target {
            assert_eq!(gathered.len(), 40);
        } else {
            assert!(gathered.is_empty());
        }
        Ok(())
    });
}
