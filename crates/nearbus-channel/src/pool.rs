/// Channel-id and negotiation-sequence allocation.
///
/// Channel ids live in a fixed-capacity bitmap per channel-type namespace.
/// Sequences come from a striding 64-bit counter with role parity, so
/// values minted by the requester side and the acceptor side are disjoint
/// over the whole counter space.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::ChannelError;
use crate::types::ChannelType;

/// Default number of concurrently allocatable channel ids per type.
pub const DEFAULT_POOL_CAPACITY: usize = 20;

/// Fixed-capacity id allocator backed by a bitmap.
///
/// `allocate` scans for the lowest free bit; exhaustion is an immediate
/// typed error, never a wait. Ids start at 1 and stay unique within this
/// pool until released.
pub struct IdPool {
    channel_type: ChannelType,
    capacity: usize,
    bits: Mutex<Vec<u64>>,
}

impl IdPool {
    pub fn new(channel_type: ChannelType, capacity: usize) -> Self {
        let words = capacity.div_ceil(64);
        Self {
            channel_type,
            capacity,
            bits: Mutex::new(vec![0; words]),
        }
    }

    /// Claim the lowest free id, or fail immediately when the pool is full.
    pub fn allocate(&self) -> Result<i32, ChannelError> {
        let mut bits = self.bits.lock().expect("id bitmap lock poisoned");
        for index in 0..self.capacity {
            let (word, bit) = (index / 64, index % 64);
            if bits[word] & (1 << bit) == 0 {
                bits[word] |= 1 << bit;
                return Ok(index as i32 + 1);
            }
        }
        Err(ChannelError::IdPoolExhausted {
            channel_type: self.channel_type,
        })
    }

    /// Return an id to the pool. Out-of-range or already-free ids are
    /// ignored with a log line; release must never fail a teardown path.
    pub fn release(&self, id: i32) {
        let Some(index) = (id > 0)
            .then(|| id as usize - 1)
            .filter(|i| *i < self.capacity)
        else {
            tracing::debug!(id, channel_type = %self.channel_type, "release of out-of-range id ignored");
            return;
        };
        let mut bits = self.bits.lock().expect("id bitmap lock poisoned");
        let (word, bit) = (index / 64, index % 64);
        if bits[word] & (1 << bit) == 0 {
            tracing::debug!(id, channel_type = %self.channel_type, "double release ignored");
            return;
        }
        bits[word] &= !(1 << bit);
    }

    /// Number of ids currently handed out.
    pub fn in_use(&self) -> usize {
        let bits = self.bits.lock().expect("id bitmap lock poisoned");
        bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

// ── Sequence generation ──────────────────────────────────────────────

/// Which side of a negotiation exchange is minting the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqRole {
    /// Locally-initiated exchanges: even sequences.
    Requester,
    /// Exchanges started for channels we accepted: odd sequences.
    Acceptor,
}

/// Monotonic sequence source with a fixed stride of 2.
///
/// The stride keeps the role parity stable across the whole 64-bit space,
/// so a requester-minted sequence can never equal an acceptor-minted one.
/// Replies echo the request's sequence and are told apart by the reply
/// flag, not by value. At 2^63 values per role, wraparound collision with
/// an in-flight sequence is not reachable in practice.
pub struct SeqGenerator {
    next: AtomicU64,
}

impl SeqGenerator {
    pub fn new(role: SeqRole) -> Self {
        let start = match role {
            SeqRole::Requester => 2,
            SeqRole::Acceptor => 1,
        };
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(2, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn allocate_until_exhausted() {
        let pool = IdPool::new(ChannelType::Udp, 20);
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let id = pool.allocate().unwrap();
            assert!(seen.insert(id), "duplicate id {id}");
        }
        assert!(matches!(
            pool.allocate(),
            Err(ChannelError::IdPoolExhausted {
                channel_type: ChannelType::Udp
            })
        ));
        assert_eq!(pool.in_use(), 20);
    }

    #[test]
    fn release_allows_reuse() {
        let pool = IdPool::new(ChannelType::TcpDirect, 4);
        let id = pool.allocate().unwrap();
        pool.release(id);
        assert_eq!(pool.allocate().unwrap(), id);
    }

    #[test]
    fn double_release_is_ignored() {
        let pool = IdPool::new(ChannelType::Proxy, 4);
        let id = pool.allocate().unwrap();
        pool.release(id);
        pool.release(id);
        // Only one slot freed: the pool must not underflow.
        assert_eq!(pool.in_use(), 0);
        pool.allocate().unwrap();
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn out_of_range_release_is_ignored() {
        let pool = IdPool::new(ChannelType::Udp, 4);
        pool.release(0);
        pool.release(-3);
        pool.release(99);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let pool = Arc::new(IdPool::new(ChannelType::Udp, 64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                (0..8).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id} across threads");
            }
        }
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn capacity_larger_than_one_word() {
        let pool = IdPool::new(ChannelType::Udp, 100);
        let ids: Vec<i32> = (0..100).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(ids.last(), Some(&100));
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn requester_sequences_are_even() {
        let gen = SeqGenerator::new(SeqRole::Requester);
        for _ in 0..10 {
            assert_eq!(gen.next() % 2, 0);
        }
    }

    #[test]
    fn acceptor_sequences_are_odd() {
        let gen = SeqGenerator::new(SeqRole::Acceptor);
        for _ in 0..10 {
            assert_eq!(gen.next() % 2, 1);
        }
    }

    #[test]
    fn sequences_are_strictly_increasing() {
        let gen = SeqGenerator::new(SeqRole::Requester);
        let mut prev = gen.next();
        for _ in 0..100 {
            let next = gen.next();
            assert!(next > prev);
            prev = next;
        }
    }

    proptest! {
        /// Any interleaving of allocate/release keeps outstanding ids unique.
        #[test]
        fn outstanding_ids_stay_unique(ops in proptest::collection::vec(0u8..3, 1..200)) {
            let pool = IdPool::new(ChannelType::Udp, 16);
            let mut outstanding = HashSet::new();
            for op in ops {
                if op == 0 {
                    match pool.allocate() {
                        Ok(id) => prop_assert!(outstanding.insert(id), "duplicate id {}", id),
                        Err(_) => prop_assert_eq!(outstanding.len(), 16),
                    }
                } else if let Some(&id) = outstanding.iter().next() {
                    outstanding.remove(&id);
                    pool.release(id);
                }
            }
            prop_assert_eq!(pool.in_use(), outstanding.len());
        }
    }
}
