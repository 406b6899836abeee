//! A cyclic barrier for the worker threads of one host.
//!
//! The flow-control channel synchronizes all local workers before and after
//! the host leader performs the inter-host step. The barrier is cyclic: the
//! same instance is reused for every collective, alternating between two
//! generation counters so a fast thread re-entering the next round cannot
//! race a slow thread still leaving the previous one.

use std::sync::{Condvar, Mutex};

/// Cyclic thread barrier using a mutex and condition variable.
pub struct ThreadBarrier {
    mutex: Mutex<BarrierState>,
    cv: Condvar,
    thread_count: usize,
}

struct BarrierState {
    counts: [usize; 2],
    current: usize,
}

impl ThreadBarrier {
    /// Create a barrier awaiting `thread_count` threads per round.
    pub fn new(thread_count: usize) -> Self {
        assert!(thread_count > 0);
        ThreadBarrier {
            mutex: Mutex::new(BarrierState {
                counts: [0, 0],
                current: 0,
            }),
            cv: Condvar::new(),
            thread_count,
        }
    }

    /// Block until `thread_count` threads have arrived.
    pub fn wait(&self) {
        let mut state = self.mutex.lock().unwrap();
        let local = state.current;
        state.counts[local] += 1;

        if state.counts[local] < self.thread_count {
            while state.counts[local] < self.thread_count {
                state = self.cv.wait(state).unwrap();
            }
        } else {
            state.current = if state.current == 0 { 1 } else { 0 };
            let next = state.current;
            state.counts[next] = 0;
            self.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn barrier_rounds_do_not_interleave() {
        let n = 4;
        let barrier = Arc::new(ThreadBarrier::new(n));
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for round in 1..=10 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait();
                        // All arrivals of this round must be visible.
                        assert!(counter.load(Ordering::SeqCst) >= round * 4);
                        barrier.wait();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 40);
    }
}
