//! Atomics-backed statistics gauges and counters.
//!
//! Every shared component (block pool, streams, multiplexer) exposes its
//! counters through these types so readers never take the component's lock.
//! Output formatting and profiling are out of scope; the raw numbers are
//! asserted in tests.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A monotonically increasing counter.
#[derive(Default, Debug)]
pub struct Counter(AtomicUsize);

impl Counter {
    #[inline]
    pub fn add(&self, v: usize) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can move both ways.
#[derive(Default, Debug)]
pub struct Gauge(AtomicUsize);

impl Gauge {
    #[inline]
    pub fn add(&self, v: usize) {
        self.0.fetch_add(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, v: usize) {
        self.0.fetch_sub(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Transfer counters kept per stream and aggregated per multiplexer.
/// `net_*` counts blocks that crossed the transport; `int_*` counts
/// same-host loopback transfers that bypassed it.
#[derive(Default, Debug)]
pub struct TransferStats {
    pub tx_net_blocks: Counter,
    pub tx_net_bytes: Counter,
    pub tx_net_items: Counter,
    pub tx_int_blocks: Counter,
    pub tx_int_bytes: Counter,
    pub tx_int_items: Counter,
    pub rx_net_blocks: Counter,
    pub rx_net_bytes: Counter,
    pub rx_net_items: Counter,
    pub rx_int_blocks: Counter,
    pub rx_int_bytes: Counter,
    pub rx_int_items: Counter,
}

impl TransferStats {
    pub fn tx_bytes(&self) -> usize {
        self.tx_net_bytes.get() + self.tx_int_bytes.get()
    }

    pub fn rx_bytes(&self) -> usize {
        self.rx_net_bytes.get() + self.rx_int_bytes.get()
    }

    pub fn tx_items(&self) -> usize {
        self.tx_net_items.get() + self.tx_int_items.get()
    }

    pub fn rx_items(&self) -> usize {
        self.rx_net_items.get() + self.rx_int_items.get()
    }
}
