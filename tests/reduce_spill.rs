//! Reduce-table spilling: correctness under tiny budgets and the
//! recursion-depth limit.

use millrace::core::{ReduceConfig, ReduceTable};
use millrace::data::{BlockPool, PoolConfig};
use millrace::{generate, Error, JobConfig};
use std::collections::HashMap;
use std::rc::Rc;

fn tiny_pool() -> BlockPool {
    BlockPool::new(PoolConfig {
        block_size: 1024,
        ..PoolConfig::default()
    })
}

#[test]
fn spilled_table_still_reduces_every_key_once() -> anyhow::Result<()> {
    let pool = tiny_pool();
    let config = ReduceConfig {
        num_partitions: 8,
        // Forces many spills for 5000 distinct keys.
        budget_bytes: 4 * 1024,
        max_spill_depth: 4,
    };
    let mut table: ReduceTable<u64, u64> =
        ReduceTable::new(pool, config, Rc::new(|a: u64, b: u64| a + b));

    for round in 0..3u64 {
        for key in 0..5000u64 {
            table.insert(key, key + round)?;
        }
    }

    let mut out: HashMap<u64, u64> = HashMap::new();
    table.flush(&mut |k, v| {
        assert!(out.insert(k, v).is_none(), "key emitted twice");
        Ok(())
    })?;

    assert_eq!(out.len(), 5000);
    for key in 0..5000u64 {
        assert_eq!(out[&key], 3 * key + 3);
    }
    Ok(())
}

#[test]
fn spill_recursion_past_the_depth_limit_is_fatal() {
    let pool = tiny_pool();
    let config = ReduceConfig {
        num_partitions: 2,
        budget_bytes: 1,
        max_spill_depth: 0,
    };
    let mut table: ReduceTable<u64, u64> =
        ReduceTable::new(pool, config, Rc::new(|a: u64, b: u64| a + b));
    for key in 0..10_000u64 {
        table.insert(key, 1).unwrap();
    }
    let result = table.flush(&mut |_k, _v| Ok(()));
    assert!(matches!(result, Err(Error::OutOfMemory(_))));
}

#[test]
fn reduce_by_key_with_a_tiny_budget_matches_the_in_memory_result() -> anyhow::Result<()> {
    let mut config = JobConfig::default();
    config.pool.block_size = 1024;
    config.reduce.budget_bytes = 8 * 1024;
    millrace::run_local_with(config, 2, 2, |ctx| {
        let n = 20_000usize;
        let pairs = generate(ctx, n).map(|i| ((i % 997) as u32, 1u64));
        let counts = pairs.reduce_pair(|a, b| a + b).all_gather()?;
        assert_eq!(counts.len(), 997);
        let total: u64 = counts.iter().map(|(_, c)| c).sum();
        assert_eq!(total, n as u64);
        for &(k, c) in &counts {
            let exact = (0..n as u64).filter(|i| i % 997 == k as u64).count() as u64;
            assert_eq!(c, exact, "count for key {k}");
        }
        Ok(())
    })?;
    Ok(())
}
