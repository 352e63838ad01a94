//! # ID Generator
//!
//! Snowflake-style 64-bit monotonic identifiers shared by both `connection_id`
//! and `data_id` spaces — there is no structural distinction between the two.
//!
//! Layout (MSB to LSB): 42 bits milliseconds-since-epoch, 10 bits node
//! discriminator, 12 bits per-millisecond sequence counter. Two ids minted
//! within the same millisecond on the same node are distinguished by the
//! counter; once the counter saturates within a millisecond the generator
//! spins forward to the next millisecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const TIMESTAMP_BITS: u32 = 42;
const NODE_BITS: u32 = 10;
const COUNTER_BITS: u32 = 12;

const NODE_MAX: u64 = (1 << NODE_BITS) - 1;
const COUNTER_MAX: u64 = (1 << COUNTER_BITS) - 1;

const NODE_SHIFT: u32 = COUNTER_BITS;
const TIMESTAMP_SHIFT: u32 = COUNTER_BITS + NODE_BITS;

/// An epoch custom to this protocol (arbitrary, just needs to be stable for
/// the process lifetime so the 42-bit timestamp field doesn't wrap for
/// centuries).
const EPOCH_MILLIS: u64 = 1_700_000_000_000;

fn now_millis() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch");
    since_epoch.as_millis() as u64
}

/// Generates monotonically increasing 64-bit ids for one node.
pub struct IdGenerator {
    node_id: u64,
    /// Packed `(last_millis << COUNTER_BITS) | counter`, updated atomically
    /// with a CAS loop so concurrent callers never observe the same id.
    state: AtomicU64,
}

impl IdGenerator {
    /// `node_id` must fit in [`NODE_BITS`] bits; values beyond that are
    /// masked, not rejected, so hosts can seed it from a hash.
    pub fn new(node_id: u64) -> Self {
        IdGenerator {
            node_id: node_id & NODE_MAX,
            state: AtomicU64::new(0),
        }
    }

    /// Mint the next id. Never repeats within this node's lifetime, barring
    /// a > 139-year clock range overflow of the 42-bit timestamp field.
    pub fn next_id(&self) -> u64 {
        loop {
            let now = now_millis().saturating_sub(EPOCH_MILLIS);
            let prev = self.state.load(Ordering::Acquire);
            let prev_millis = prev >> COUNTER_BITS;

            let (millis, counter) = if now > prev_millis {
                (now, 0u64)
            } else {
                let next_counter = (prev & COUNTER_MAX) + 1;
                if next_counter > COUNTER_MAX {
                    // Counter exhausted within this millisecond: advance to
                    // the next millisecond instead of blocking.
                    (prev_millis + 1, 0u64)
                } else {
                    (prev_millis, next_counter)
                }
            };

            let new_state = (millis << COUNTER_BITS) | counter;
            if self
                .state
                .compare_exchange_weak(prev, new_state, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return (millis << TIMESTAMP_SHIFT) | (self.node_id << NODE_SHIFT) | counter;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ids_are_monotonically_non_decreasing() {
        let gen = IdGenerator::new(1);
        let mut last = 0u64;
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > last, "id generator must be strictly increasing");
            last = id;
        }
    }

    #[test]
    fn ids_never_repeat_under_contention() {
        let gen = Arc::new(IdGenerator::new(2));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gen = gen.clone();
            handles.push(thread::spawn(move || {
                (0..5000).map(|_| gen.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id generated");
            }
        }
        assert_eq!(all.len(), 8 * 5000);
    }

    #[test]
    fn node_id_is_embedded_and_masked() {
        let gen = IdGenerator::new(0xFFFF); // exceeds NODE_BITS, must be masked
        let id = gen.next_id();
        let embedded_node = (id >> NODE_SHIFT) & NODE_MAX;
        assert_eq!(embedded_node, 0xFFFF & NODE_MAX);
    }

    #[test]
    fn distinct_nodes_do_not_collide_even_with_same_counter() {
        let a = IdGenerator::new(1);
        let b = IdGenerator::new(2);
        let ida = a.next_id();
        let idb = b.next_id();
        assert_ne!(ida, idb);
    }
}
