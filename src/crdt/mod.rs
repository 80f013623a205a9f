//! CRDT core: causal clocks, the operation log, and the replica container.

pub mod clock;
pub mod oplog;
pub mod replica;

/// A CRDT is a data type with a merge operator that is commutative,
/// associative, and idempotent.
pub trait Crdt {
    /// Merge another instance into this one.
    fn merge(&mut self, other: &Self);
}
