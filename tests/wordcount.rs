//! The canonical word count over a scattered text input.

use millrace::testing::{assert_kv_collections_equal, run_local_test};
use millrace::distribute_from;

#[test]
fn word_count_over_scattered_lines() {
    run_local_test(|ctx| {
        let lines = vec![
            "test".to_string(),
            "this".to_string(),
            "might be".to_string(),
            "a test".to_string(),
            "a test".to_string(),
            "a test".to_string(),
        ];
        let counts = distribute_from(ctx, lines, 0)
            .flat_map(|line: String| {
                line.split(' ').map(str::to_string).collect::<Vec<_>>()
            })
            .map(|word| (word, 1u64))
            .reduce_pair(|a, b| a + b);

        let out = counts.all_gather()?;
        assert_kv_collections_equal(
            out,
            vec![
                ("a".to_string(), 3),
                ("be".to_string(), 1),
                ("might".to_string(), 1),
                ("test".to_string(), 4),
                ("this".to_string(), 1),
            ],
        );
        Ok(())
    });
}

#[test]
fn word_count_via_reduce_by_key() {
    run_local_test(|ctx| {
        let lines = vec![
            "the quick brown fox".to_string(),
            "jumps over the lazy dog".to_string(),
            "the end".to_string(),
        ];
        let counts = distribute_from(ctx, lines, 0)
            .flat_map(|line: String| {
                line.split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .map(|word| (word, 1u64))
            .reduce_by_key(|p| p.0.clone(), |a, b| (a.0, a.1 + b.1));

        let mut out = counts.all_gather()?;
        out.sort();
        assert_eq!(out.len(), 9);
        assert_eq!(
            out.iter().find(|(w, _)| w == "the"),
            Some(&("the".to_string(), 3))
        );
        assert_eq!(out.iter().map(|(_, c)| c).sum::<u64>(), 11);
        Ok(())
    });
}
