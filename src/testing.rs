//! Test utilities: collection assertions and a multi-topology harness.
//!
//! Distributed operators must behave identically regardless of how the
//! worker group is laid out, so [`run_local_test`] runs a job closure on
//! several `(hosts, workers_per_host)` topologies in sequence. The
//! assertion helpers compare collections with detailed failure messages.

use crate::api::context::Context;
use crate::error::Result;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Topologies every operator test runs under: single worker, single host
/// with several workers, and multiple hosts.
pub const TEST_TOPOLOGIES: &[(usize, usize)] = &[(1, 1), (1, 3), (2, 2)];

/// Run `job` under every test topology with small blocks so block
/// boundary handling is exercised even by tiny inputs.
pub fn run_local_test<F>(job: F)
where
    F: Fn(&mut Context) -> Result<()> + Send + Sync + Clone + 'static,
{
    for &(hosts, workers) in TEST_TOPOLOGIES {
        let mut config = crate::api::context::JobConfig::default();
        config.pool.block_size = 4 * 1024;
        crate::api::context::run_local_with(config, hosts, workers, job.clone())
            .unwrap_or_else(|e| panic!("job failed on topology {hosts}x{workers}: {e}"));
    }
}

/// Assert that two collections are equal in order and content.
///
/// # Panics
///
/// Panics if the collections differ in length or content.
pub fn assert_collections_equal<T: Debug + PartialEq>(actual: &[T], expected: &[T]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Collection length mismatch:\n  Expected: {expected:?}\n  Actual: {actual:?}",
    );
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert_eq!(
            a, e,
            "Collection mismatch at index {i}:\n  Expected: {expected:?}\n  Actual: {actual:?}"
        );
    }
}

/// Assert that two collections hold the same multiset of elements,
/// ignoring order.
///
/// # Panics
///
/// Panics if any element occurs a different number of times.
pub fn assert_collections_unordered_equal<T: Debug + Eq + Hash>(actual: &[T], expected: &[T]) {
    let mut counts: HashMap<&T, isize> = HashMap::new();
    for a in actual {
        *counts.entry(a).or_default() += 1;
    }
    for e in expected {
        *counts.entry(e).or_default() -= 1;
    }
    let diff: Vec<_> = counts.iter().filter(|&(_, &c)| c != 0).collect();
    assert!(
        diff.is_empty(),
        "Collection content mismatch (element, surplus): {diff:?}\n  Expected: {expected:?}\n  Actual: {actual:?}"
    );
}

/// Assert that two key-value collections are equal after sorting by key.
///
/// # Panics
///
/// Panics if the collections differ after sorting by key.
pub fn assert_kv_collections_equal<K, V>(mut actual: Vec<(K, V)>, mut expected: Vec<(K, V)>)
where
    K: Debug + Ord,
    V: Debug + PartialEq,
{
    actual.sort_by(|a, b| a.0.cmp(&b.0));
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        actual.len(),
        expected.len(),
        "Collection length mismatch:\n  Expected: {expected:?}\n  Actual: {actual:?}",
    );
    for (i, ((ak, av), (ek, ev))) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            ak == ek && av == ev,
            "Pair mismatch at sorted index {i}: expected ({ek:?}, {ev:?}), got ({ak:?}, {av:?})"
        );
    }
}
