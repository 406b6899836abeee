//! Stream shuffle tests: conservation under mix ordering, deterministic
//! cat ordering, and the transfer statistics.

use millrace::testing::run_local_test;

#[test]
fn mix_stream_conserves_the_multiset() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    run_local_test(|ctx| {
        let p = ctx.num_workers();
        let me = ctx.global_rank();
        let n = 2000usize;

        let stream = ctx.new_mix_stream()?;
        let mut writers = stream.open_writers()?;
        let mut sent = vec![0usize; p];
        for i in 0..n {
            let item = (me * n + i) as u64;
            let target = (item.wrapping_mul(0x9e37_79b9)) as usize % p;
            writers[target].put(&item)?;
            sent[target] += 1;
        }
        for writer in &mut writers {
            writer.close()?;
        }

        let mut received = Vec::new();
        let mut reader = stream.reader();
        while reader.has_next()? {
            received.push(reader.next::<u64>()?);
        }

        // Global conservation: P * n items total, and each worker received
        // exactly what the senders recorded for it.
        let flow = ctx.flow();
        let all_counts: Vec<usize> = flow.all_gather(&received.len())?;
        assert_eq!(all_counts.iter().sum::<usize>(), p * n);
        let all_sent: Vec<Vec<usize>> = flow.all_gather(&sent)?;
        let expected_here: usize = all_sent.iter().map(|s| s[me]).sum();
        assert_eq!(received.len(), expected_here);

        // Every received item routes to this worker, exactly once.
        let mut seen = std::collections::HashSet::new();
        for &item in &received {
            assert_eq!((item.wrapping_mul(0x9e37_79b9)) as usize % p, me);
            assert!(seen.insert(item));
        }

        // The per-stream counters agree with what was observed.
        assert_eq!(stream.stats().rx_items(), received.len());
        assert_eq!(stream.stats().tx_items(), n);
        Ok(())
    });
}

#[test]
fn cat_stream_orders_by_sender_rank() {
    run_local_test(|ctx| {
        let p = ctx.num_workers();
        let me = ctx.global_rank();
        let per_peer = 100usize;

        let stream = ctx.new_cat_stream()?;
        let mut writers = stream.open_writers()?;
        for (target, writer) in writers.iter_mut().enumerate() {
            for i in 0..per_peer {
                writer.put(&(me as u64, (target * per_peer + i) as u64))?;
            }
            writer.close()?;
        }

        // Cat order: all of sender 0, then sender 1, and so on; within one
        // sender, write order.
        let mut reader = stream.reader();
        for sender in 0..p {
            for i in 0..per_peer {
                assert!(reader.has_next()?);
                let (s, v): (u64, u64) = reader.next()?;
                assert_eq!(s, sender as u64);
                assert_eq!(v, (me * per_peer + i) as u64);
            }
        }
        assert!(!reader.has_next()?);
        Ok(())
    });
}

#[test]
fn same_host_traffic_bypasses_the_network() {
    // One host: every transfer is a loopback.
    millrace::run_local(1, 3, |ctx| {
        let stream = ctx.new_cat_stream()?;
        let mut writers = stream.open_writers()?;
        for writer in &mut writers {
            for i in 0..50u64 {
                writer.put(&i)?;
            }
            writer.close()?;
        }
        let mut reader = stream.reader();
        let mut count = 0;
        while reader.has_next()? {
            let _: u64 = reader.next()?;
            count += 1;
        }
        assert_eq!(count, 3 * 50);
        assert_eq!(stream.stats().tx_net_bytes.get(), 0);
        assert!(stream.stats().tx_int_bytes.get() > 0);
        assert_eq!(stream.stats().rx_net_bytes.get(), 0);
        Ok(())
    })
    .unwrap();
}
