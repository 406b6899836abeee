//! Block layer tests: writer/reader round trips, files, queues and the
//! pool's eviction accounting.

use millrace::data::{BlockPool, BlockQueue, File, PoolConfig};
use serde::{Deserialize, Serialize};

fn small_pool(block_size: usize) -> BlockPool {
    BlockPool::new(PoolConfig {
        block_size,
        ..PoolConfig::default()
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Record {
    id: u64,
    name: String,
}

fn record(i: u64) -> Record {
    Record {
        id: i,
        // Varied lengths so items straddle the tiny blocks.
        name: "x".repeat((i % 67) as usize),
    }
}

#[test]
fn file_round_trip_with_straddling_items() -> anyhow::Result<()> {
    let pool = small_pool(64);
    let file = File::new();
    let mut writer = file.writer(&pool);
    for i in 0..1000u64 {
        writer.put(&record(i))?;
    }
    writer.close()?;

    assert_eq!(file.num_items(), 1000);
    assert!(file.num_blocks() > 10, "tiny blocks should split the data");

    let mut reader = file.reader();
    for i in 0..1000u64 {
        assert!(reader.has_next()?);
        assert_eq!(reader.next::<Record>()?, record(i));
    }
    assert!(!reader.has_next()?);
    assert!(reader.next::<Record>().is_err());
    Ok(())
}

#[test]
fn reader_at_seeks_to_any_item() -> anyhow::Result<()> {
    let pool = small_pool(128);
    let file = File::new();
    let mut writer = file.writer(&pool);
    for i in 0..500u64 {
        writer.put(&record(i))?;
    }
    writer.close()?;

    for &k in &[0usize, 1, 99, 123, 255, 499] {
        let mut reader = file.reader_at(k)?;
        assert_eq!(reader.next::<Record>()?, record(k as u64));
    }
    assert!(file.reader_at(500).is_err());
    Ok(())
}

#[test]
fn consume_reader_releases_the_file() -> anyhow::Result<()> {
    let pool = small_pool(256);
    let file = File::new();
    let mut writer = file.writer(&pool);
    for i in 0..100u64 {
        writer.put(&i)?;
    }
    writer.close()?;

    let mut reader = file.consume_reader();
    let values: Vec<u64> = reader.collect_vec()?;
    assert_eq!(values, (0..100).collect::<Vec<_>>());
    assert_eq!(file.num_items(), 0);
    assert_eq!(file.num_blocks(), 0);
    Ok(())
}

#[test]
fn queue_pipes_blocks_between_threads() -> anyhow::Result<()> {
    let pool = small_pool(128);
    let queue = BlockQueue::new(2);

    let producer = {
        let queue = queue.clone();
        let pool = pool.clone();
        std::thread::spawn(move || -> millrace::Result<()> {
            let mut writer = queue.writer(&pool);
            for i in 0..2000u64 {
                writer.put(&record(i))?;
            }
            writer.close()
        })
    };

    let mut reader = queue.reader(true);
    let mut count = 0u64;
    while reader.has_next()? {
        assert_eq!(reader.next::<Record>()?, record(count));
        count += 1;
        // Bounded pipe: the producer can never run far ahead.
        assert!(queue.len() <= 2);
    }
    assert_eq!(count, 2000);
    producer.join().unwrap()?;
    Ok(())
}

#[test]
fn keep_queue_can_be_read_again() -> anyhow::Result<()> {
    let pool = small_pool(128);
    let queue = BlockQueue::new(4);
    let mut writer = queue.writer(&pool);
    for i in 0..50u64 {
        writer.put(&i)?;
    }
    writer.close()?;

    let first: Vec<u64> = queue.reader(false).collect_vec()?;
    assert_eq!(first, (0..50).collect::<Vec<_>>());

    // After the pipe drained, the keep cache serves re-reads.
    let second: Vec<u64> = queue.reader(false).collect_vec()?;
    assert_eq!(second, first);
    Ok(())
}

#[test]
fn pool_evicts_to_swap_and_loads_back() -> anyhow::Result<()> {
    let pool = BlockPool::new(PoolConfig {
        block_size: 1024,
        soft_limit: 8 * 1024,
        hard_limit: usize::MAX,
    });

    let blocks: Vec<_> = (0..32u8)
        .map(|i| pool.allocate(vec![i; 1024]).unwrap())
        .collect();

    let stats = pool.stats();
    assert_eq!(stats.total.get(), 32 * 1024);
    assert!(stats.resident.get() <= 8 * 1024);
    assert!(stats.swapped.get() > 0);
    assert_eq!(stats.resident.get() + stats.swapped.get(), stats.total.get());

    // Pinning loads evicted blocks back with their bytes intact.
    for (i, block) in blocks.iter().enumerate() {
        let pinned = pool.pin(block)?;
        assert!(pinned.data().iter().all(|&b| b == i as u8));
        assert!(pool.stats().pinned.get() <= pool.stats().resident.get());
    }
    Ok(())
}
