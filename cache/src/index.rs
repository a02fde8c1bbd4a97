//! The four cache indices, externalized into ordered maps keyed by
//! `(64-bit key, entry slot index)`.
//!
//! The slot component makes keys unique; relative ordering of entries
//! sharing a key is an internal artifact callers must not rely on.

use super::*;
use std::collections::BTreeMap;
use std::hash::BuildHasher;

pub(crate) type IndexKey = (u64, u32);

/// Stable 64-bit key for an id, destination or custodian.
pub(crate) fn key_of<T: std::hash::Hash>(v: &T) -> u64 {
    foldhash::fast::FixedState::default().hash_one(v)
}

#[derive(Default)]
pub(crate) struct Indices {
    /// Bundle id (source EID + creation timestamp) hash.
    pub primary_id: BTreeMap<IndexKey, Handle>,
    /// Destination EID hash.
    pub destination: BTreeMap<IndexKey, Handle>,
    /// Previous-custodian hash; open custody signals only.
    pub custodian: BTreeMap<IndexKey, Handle>,
    /// Next-action DTN time in milliseconds; key 0 is never present.
    pub time: BTreeMap<IndexKey, Handle>,
}

impl Indices {
    pub fn is_empty(&self) -> bool {
        self.primary_id.is_empty()
            && self.destination.is_empty()
            && self.custodian.is_empty()
            && self.time.is_empty()
    }

    /// Entries whose next-action time is due at `now`, earliest first.
    pub fn due(&self, now: DtnTime) -> Vec<(IndexKey, Handle)> {
        self.time
            .range((1, 0)..=(now.millisecs(), u32::MAX))
            .map(|(k, h)| (*k, *h))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_pool::{block::NullBlocktypeApi, pool::BLOCK_SIZE, BlockKind, Pool};

    #[test]
    fn key_is_stable_per_value() {
        let a = Eid::Ipn {
            node: 10,
            service: 3,
        };
        let b = Eid::Ipn {
            node: 10,
            service: 3,
        };
        assert_eq!(key_of(&a), key_of(&b));
        assert_ne!(key_of(&a), key_of(&Eid::Null));
    }

    #[test]
    fn due_respects_the_zero_sentinel_and_now() {
        let pool = Pool::new(&cairn_pool::Config {
            capacity: core::num::NonZeroUsize::new(4 * BLOCK_SIZE).unwrap(),
            bundle_threshold: 0,
            internal_threshold: 0,
        })
        .unwrap();
        pool.register_blocktype(1, BlockKind::Chunk, Arc::new(NullBlocktypeApi), 0)
            .unwrap();
        let a = pool
            .alloc_chunk(1, bytes::Bytes::new(), 255)
            .unwrap();
        let b = pool
            .alloc_chunk(1, bytes::Bytes::new(), 255)
            .unwrap();

        let mut ix = Indices::default();
        ix.time.insert((100, a.index()), a);
        ix.time.insert((200, b.index()), b);
        assert!(ix.due(DtnTime::new(99)).is_empty());
        assert_eq!(ix.due(DtnTime::new(100)).len(), 1);
        assert_eq!(ix.due(DtnTime::new(500)).len(), 2);
    }
}
