//! Distributed sort and merge tests, including the external-run path.

use millrace::testing::{assert_collections_equal, run_local_test};
use millrace::{equal_to_dia, generate_with, JobConfig};

#[test]
fn sort_of_reversed_integers() {
    run_local_test(|ctx| {
        let n = 1000usize;
        let reversed = generate_with(ctx, n, move |i| (n - 1 - i) as u64);
        let sorted = reversed.sort(|a, b| a.cmp(b)).cache();
        assert_eq!(sorted.size()?, 1000);
        let out = sorted.all_gather()?;
        let expected: Vec<u64> = (0..n as u64).collect();
        assert_collections_equal(&out, &expected);
        Ok(())
    });
}

#[test]
fn sort_with_heavy_key_ties() {
    run_local_test(|ctx| {
        // Only three distinct keys over 900 items: splitter boundaries are
        // all ties, exercising the balancing rule.
        let values = generate_with(ctx, 900, |i| (i % 3) as u64);
        let out = values.sort(|a, b| a.cmp(b)).all_gather()?;
        assert_eq!(out.len(), 900);
        let mut expected = Vec::new();
        for k in 0..3u64 {
            expected.extend(std::iter::repeat_n(k, 300));
        }
        assert_collections_equal(&out, &expected);
        Ok(())
    });
}

#[test]
fn sort_spills_runs_under_a_tiny_budget() -> anyhow::Result<()> {
    let mut config = JobConfig::default();
    config.pool.block_size = 1024;
    // A few hundred bytes per run forces many runs and a real merge.
    config.sort_run_bytes = 512;
    millrace::run_local_with(config, 2, 2, |ctx| {
        let n = 5000usize;
        // Deterministic pseudo-shuffle of 0..n.
        let scrambled = generate_with(ctx, n, move |i| ((i * 2654435761) % n) as u64);
        let out = scrambled.sort(|a, b| a.cmp(b)).all_gather()?;
        assert_eq!(out.len(), n);
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert_eq!(out, sorted);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn merge_two_sorted_collections() {
    run_local_test(|ctx| {
        let evens: Vec<u64> = (0..100).map(|i| i * 2).collect();
        let odds: Vec<u64> = (0..100).map(|i| i * 2 + 1).collect();
        let a = equal_to_dia(ctx, evens);
        let b = equal_to_dia(ctx, odds);
        let merged = a.merge_with(&b, |x, y| x.cmp(y));
        let out = merged.all_gather()?;
        let expected: Vec<u64> = (0..200).collect();
        assert_collections_equal(&out, &expected);
        Ok(())
    });
}
