//! Deterministic hashing for shuffle partitioning and reduce tables.
//!
//! Shuffles route an item by `hash(key) % num_workers`, and every worker
//! must agree on the routing, so the std `RandomState` (per-process random
//! keys) cannot be used. This module provides a fixed-key FNV-1a hasher and
//! a 64-bit mix finalizer. Reduce-table spill recursion re-hashes with a
//! distinct seed per recursion depth to break pathological skew.

use std::hash::{Hash, Hasher};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a with a 64-bit avalanche finalizer. Deterministic across processes
/// and platforms, which is the whole point.
pub struct FixedHasher {
    state: u64,
}

impl FixedHasher {
    pub fn new() -> Self {
        FixedHasher { state: FNV_OFFSET }
    }

    /// A hasher whose output stream differs per `seed`. Seeds are folded in
    /// as a prefix so two seeds never produce colliding streams in lockstep.
    pub fn with_seed(seed: u64) -> Self {
        let mut h = FixedHasher::new();
        h.write_u64(seed);
        h
    }
}

impl Default for FixedHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for FixedHasher {
    fn finish(&self) -> u64 {
        mix64(self.state)
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut s = self.state;
        for &b in bytes {
            s ^= u64::from(b);
            s = s.wrapping_mul(FNV_PRIME);
        }
        self.state = s;
    }
}

/// Finalization step: a splitmix64-style avalanche so low bits are usable
/// for `% num_partitions` style indexing.
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Hash any `Hash` value with the fixed-key hasher.
pub fn hash_value<T: Hash + ?Sized>(v: &T) -> u64 {
    let mut h = FixedHasher::new();
    v.hash(&mut h);
    h.finish()
}

/// Hash with a seed; used by the reduce table's re-hash recursion.
pub fn hash_value_seeded<T: Hash + ?Sized>(v: &T, seed: u64) -> u64 {
    let mut h = FixedHasher::with_seed(seed);
    v.hash(&mut h);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_seed_sensitive() {
        assert_eq!(hash_value("shuffle"), hash_value("shuffle"));
        assert_ne!(hash_value("a"), hash_value("b"));
        assert_ne!(hash_value_seeded(&42u64, 0), hash_value_seeded(&42u64, 1));
    }
}
