//! Replica identity and state vectors.
//!
//! Every editing site (a client replica or the server's shared container)
//! is identified by a [`ReplicaId`]. Each replica consumes one sequence
//! number per inserted byte and one per delete operation, so the pair
//! (replica, seq) names every operation ever produced.
//!
//! A [`StateVector`] summarizes causal history: for each replica, how many
//! of its sequence numbers have been observed. Two containers exchange
//! state vectors to compute exactly the operations the other is missing.
//!
//! Complexity:
//! - observe / seen / contains: O(1)
//! - merge: O(n) where n is the number of replicas
//! - encode: O(n log n) (entries are sorted for a canonical encoding)

use rand_core::OsRng;
use rand_core::RngCore;
use rustc_hash::FxHashMap;

use crate::error::DecodeError;
use crate::wire;

/// Identifies one editing replica.
///
/// Ids are random 64-bit values, generated per replica instance. The id
/// participates in conflict resolution ordering, so it must be globally
/// unique for the lifetime of a document's history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Generate a random replica id.
    pub fn generate() -> ReplicaId {
        return ReplicaId(OsRng.next_u64());
    }
}

/// Per-replica counts of observed sequence numbers.
///
/// `seen(r)` is both the number of sequence numbers observed from `r` and
/// the next sequence number this container expects from `r`. Operations
/// from one replica are integrated strictly in sequence order, so a single
/// counter per replica captures the whole causal frontier.
#[derive(Clone, Debug, Default)]
pub struct StateVector {
    entries: FxHashMap<ReplicaId, u64>,
}

impl StateVector {
    /// Create an empty state vector (nothing observed).
    pub fn new() -> StateVector {
        return StateVector {
            entries: FxHashMap::default(),
        };
    }

    /// Number of sequence numbers observed from the given replica.
    pub fn seen(&self, replica: ReplicaId) -> u64 {
        return *self.entries.get(&replica).unwrap_or(&0);
    }

    /// Record that sequence numbers up to (but not including) `upto` have
    /// been observed from the given replica.
    pub fn observe(&mut self, replica: ReplicaId, upto: u64) {
        let entry = self.entries.entry(replica).or_insert(0);
        *entry = (*entry).max(upto);
    }

    /// Check whether a specific sequence number has been observed.
    pub fn contains(&self, replica: ReplicaId, seq: u64) -> bool {
        return seq < self.seen(replica);
    }

    /// Merge with another vector, taking the pointwise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, upto) in &other.entries {
            self.observe(*replica, *upto);
        }
    }

    /// Iterate over all (replica, count) entries with nonzero counts.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        return self
            .entries
            .iter()
            .filter(|(_, upto)| **upto > 0)
            .map(|(replica, upto)| (*replica, *upto));
    }

    /// Encode to compact bytes. Entries are sorted by replica id so that
    /// equal vectors always encode to equal bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut entries: Vec<(ReplicaId, u64)> = self.iter().collect();
        entries.sort();

        let mut out = Vec::new();
        wire::write_varint(&mut out, entries.len() as u64);
        for (replica, upto) in entries {
            wire::write_varint(&mut out, replica.0);
            wire::write_varint(&mut out, upto);
        }
        return out;
    }

    /// Decode from bytes produced by [`StateVector::encode`].
    pub fn decode(bytes: &[u8]) -> Result<StateVector, DecodeError> {
        let mut reader = wire::Reader::new(bytes);
        let count = reader.read_varint()?;
        // Each entry is at least two bytes; reject absurd counts early.
        if count > (bytes.len() as u64) {
            return Err(DecodeError::BadLength(count));
        }

        let mut vector = StateVector::new();
        for _ in 0..count {
            let replica = ReplicaId(reader.read_varint()?);
            let upto = reader.read_varint()?;
            vector.observe(replica, upto);
        }
        reader.finish()?;
        return Ok(vector);
    }
}

impl PartialEq for StateVector {
    fn eq(&self, other: &Self) -> bool {
        // Equal if all nonzero entries match; zero entries are implicit.
        for (replica, upto) in self.iter() {
            if other.seen(replica) != upto {
                return false;
            }
        }
        for (replica, upto) in other.iter() {
            if self.seen(replica) != upto {
                return false;
            }
        }
        return true;
    }
}

impl Eq for StateVector {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_vector_has_seen_nothing() {
        let vector = StateVector::new();
        assert_eq!(vector.seen(ReplicaId(1)), 0);
        assert!(!vector.contains(ReplicaId(1), 0));
    }

    #[test]
    fn observe_and_contains() {
        let mut vector = StateVector::new();
        vector.observe(ReplicaId(1), 3);

        assert_eq!(vector.seen(ReplicaId(1)), 3);
        assert!(vector.contains(ReplicaId(1), 0));
        assert!(vector.contains(ReplicaId(1), 2));
        assert!(!vector.contains(ReplicaId(1), 3));
    }

    #[test]
    fn observe_never_regresses() {
        let mut vector = StateVector::new();
        vector.observe(ReplicaId(1), 5);
        vector.observe(ReplicaId(1), 3);
        assert_eq!(vector.seen(ReplicaId(1)), 5);
    }

    #[test]
    fn merge_takes_pointwise_maximum() {
        let mut a = StateVector::new();
        a.observe(ReplicaId(1), 5);
        a.observe(ReplicaId(2), 1);

        let mut b = StateVector::new();
        b.observe(ReplicaId(1), 3);
        b.observe(ReplicaId(3), 7);

        a.merge(&b);
        assert_eq!(a.seen(ReplicaId(1)), 5);
        assert_eq!(a.seen(ReplicaId(2)), 1);
        assert_eq!(a.seen(ReplicaId(3)), 7);
    }

    #[test]
    fn equality_ignores_zero_entries() {
        let mut a = StateVector::new();
        a.observe(ReplicaId(1), 2);
        a.observe(ReplicaId(2), 0);

        let mut b = StateVector::new();
        b.observe(ReplicaId(1), 2);

        assert_eq!(a, b);
    }

    #[test]
    fn encode_is_canonical() {
        // Same entries inserted in different orders encode identically.
        let mut a = StateVector::new();
        a.observe(ReplicaId(2), 4);
        a.observe(ReplicaId(1), 9);

        let mut b = StateVector::new();
        b.observe(ReplicaId(1), 9);
        b.observe(ReplicaId(2), 4);

        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut vector = StateVector::new();
        vector.observe(ReplicaId(1), 300);
        vector.observe(ReplicaId(u64::MAX), 1);

        let decoded = StateVector::decode(&vector.encode()).unwrap();
        assert_eq!(decoded, vector);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let mut vector = StateVector::new();
        vector.observe(ReplicaId(7), 130);
        let bytes = vector.encode();

        let result = StateVector::decode(&bytes[..bytes.len() - 1]);
        assert!(result.is_err());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = StateVector::new().encode();
        bytes.push(0);
        assert_eq!(
            StateVector::decode(&bytes),
            Err(DecodeError::TrailingBytes)
        );
    }

    #[test]
    fn decode_rejects_absurd_count() {
        let mut bytes = Vec::new();
        wire::write_varint(&mut bytes, u64::MAX);
        assert!(StateVector::decode(&bytes).is_err());
    }
}
