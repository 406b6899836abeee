//! Sliding windows and element-wise zip.

use millrace::testing::{assert_collections_equal, run_local_test};
use millrace::{generate, generate_with, Error};

#[test]
fn window_sums_of_consecutive_triples() {
    run_local_test(|ctx| {
        let values = generate(ctx, 10).map(|i| i as u64);
        let out = values.window(3, |w| w.iter().sum::<u64>()).all_gather()?;
        // Windows end at global indexes 2..=9.
        let expected: Vec<u64> = (2..10u64).map(|end| 3 * end - 3).collect();
        assert_collections_equal(&out, &expected);
        Ok(())
    });
}

#[test]
fn window_larger_than_input_emits_nothing() {
    run_local_test(|ctx| {
        let values = generate(ctx, 4).map(|i| i as u64);
        assert_eq!(values.window(10, |w| w.len()).size()?, 0);
        Ok(())
    });
}

#[test]
fn flat_window_emits_multiple_outputs_per_window() {
    run_local_test(|ctx| {
        let values = generate(ctx, 6).map(|i| i as u64);
        let out = values
            .flat_window(2, |w, emit| {
                emit(w[0]);
                emit(w[1]);
            })
            .size()?;
        // 5 windows, two outputs each.
        assert_eq!(out, 10);
        Ok(())
    });
}

#[test]
fn zip_pairs_elements_by_global_index() {
    run_local_test(|ctx| {
        let a = generate(ctx, 50).map(|i| i as u64);
        let b = generate_with(ctx, 50, |i| (i * 10) as u64);
        let out = a.zip(&b, |x, y| x + y).all_gather()?;
        let expected: Vec<u64> = (0..50u64).map(|i| i * 11).collect();
        assert_collections_equal(&out, &expected);
        Ok(())
    });
}

#[test]
fn zip_of_unequal_sizes_is_a_config_error() {
    millrace::run_local(1, 2, |ctx| {
        let a = generate(ctx, 10);
        let b = generate(ctx, 11);
        let result = a.zip(&b, |x, y| x + y).size();
        match result {
            Err(Error::Worker { source, .. }) => {
                assert!(matches!(*source, Error::Config(_)));
            }
            other => panic!("expected a config error, got {other:?}"),
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn zip_a_collection_with_itself() {
    run_local_test(|ctx| {
        let values = generate(ctx, 20).map(|i| i as u64);
        let out = values.zip(&values, |x, y| x + y).all_gather()?;
        let expected: Vec<u64> = (0..20u64).map(|i| i * 2).collect();
        assert_collections_equal(&out, &expected);
        Ok(())
    });
}
