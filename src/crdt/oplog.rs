//! The causal update log: per-replica, append-only operation sequences.
//!
//! Every edit decodes to one or more [`Op`]s. The log keeps each replica's
//! operations in sequence order with no gaps, which makes it the source of
//! truth for catch-up: given a peer's state vector, the operations the
//! peer is missing are exactly the per-replica suffixes past the peer's
//! counters.
//!
//! Operations are never mutated once appended. Insert runs that a peer has
//! partially observed are sliced on the way out, not in place.

use rustc_hash::FxHashMap;

use crate::crdt::clock::ReplicaId;
use crate::crdt::clock::StateVector;

/// Identifies one inserted byte: the replica that produced it and the
/// sequence number it consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ItemId {
    pub replica: ReplicaId,
    pub seq: u64,
}

impl ItemId {
    /// Create a new item id.
    pub fn new(replica: ReplicaId, seq: u64) -> ItemId {
        return ItemId { replica, seq };
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        return Some(self.cmp(other));
    }
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.replica.cmp(&other.replica) {
            std::cmp::Ordering::Equal => self.seq.cmp(&other.seq),
            other => other,
        }
    }
}

/// A contiguous run of item ids from a single replica, targeted by a
/// delete operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdRange {
    pub replica: ReplicaId,
    pub start: u64,
    pub len: u64,
}

impl IdRange {
    /// Sequence number one past the end of the range.
    pub fn end(&self) -> u64 {
        return self.start + self.len;
    }
}

/// The payload of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpBody {
    /// Insert `content` between the two origin items.
    ///
    /// `left` is the item immediately to the left at insertion time
    /// (`None` = beginning of the document); `right` is the item
    /// immediately to the right (`None` = end). Dual origins are what make
    /// concurrent-insert ordering deterministic (the YATA approach).
    ///
    /// Consumes one sequence number per content byte.
    Insert {
        left: Option<ItemId>,
        right: Option<ItemId>,
        content: Vec<u8>,
    },

    /// Tombstone every item in the target ranges.
    ///
    /// Consumes one sequence number.
    Delete { targets: Vec<IdRange> },
}

/// One operation, identified by its originating replica and the first
/// sequence number it consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    pub replica: ReplicaId,
    pub seq: u64,
    pub body: OpBody,
}

impl Op {
    /// Number of sequence numbers this operation consumes.
    pub fn span(&self) -> u64 {
        match &self.body {
            OpBody::Insert { content, .. } => content.len() as u64,
            OpBody::Delete { .. } => 1,
        }
    }

    /// Sequence number one past this operation's last.
    pub fn end(&self) -> u64 {
        return self.seq + self.span();
    }

    /// Slice an insert run, keeping only content from `from_seq` onward.
    ///
    /// The suffix's left origin becomes the byte immediately before it in
    /// the same run; the right origin is an insertion-time property and is
    /// kept as-is. Mirrors how a materialized item splits.
    ///
    /// `from_seq` must lie strictly inside the run, and `self` must be an
    /// insert.
    pub fn insert_suffix(&self, from_seq: u64) -> Op {
        debug_assert!(from_seq > self.seq && from_seq < self.end());
        match &self.body {
            OpBody::Insert { right, content, .. } => {
                let offset = (from_seq - self.seq) as usize;
                return Op {
                    replica: self.replica,
                    seq: from_seq,
                    body: OpBody::Insert {
                        left: Some(ItemId::new(self.replica, from_seq - 1)),
                        right: *right,
                        content: content[offset..].to_vec(),
                    },
                };
            }
            OpBody::Delete { .. } => unreachable!("delete operations span one seq"),
        }
    }
}

/// Append-only log of operations, grouped by originating replica and
/// ordered by sequence number within each group.
#[derive(Clone, Debug, Default)]
pub struct OpLog {
    by_replica: FxHashMap<ReplicaId, Vec<Op>>,
}

impl OpLog {
    /// Create an empty log.
    pub fn new() -> OpLog {
        return OpLog {
            by_replica: FxHashMap::default(),
        };
    }

    /// Total number of operations across all replicas.
    pub fn len(&self) -> usize {
        return self.by_replica.values().map(|ops| ops.len()).sum();
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        return self.by_replica.is_empty();
    }

    /// Append an operation.
    ///
    /// Operations from one replica must arrive in sequence order with no
    /// gaps; the replica container guarantees this by parking out-of-order
    /// operations before they reach the log.
    pub fn push(&mut self, op: Op) {
        let ops = self.by_replica.entry(op.replica).or_default();
        debug_assert_eq!(
            ops.last().map(|last| last.end()).unwrap_or(0),
            op.seq,
            "op log gap for replica {:?}",
            op.replica,
        );
        ops.push(op);
    }

    /// All operations the peer has not observed, in per-replica sequence
    /// order with replicas sorted by id (a canonical order, so the same
    /// history always produces the same bytes downstream).
    ///
    /// Insert runs the peer has partially observed are sliced to the
    /// unobserved suffix.
    pub fn ops_since(&self, peer: &StateVector) -> Vec<Op> {
        let mut replicas: Vec<ReplicaId> = self.by_replica.keys().copied().collect();
        replicas.sort();

        let mut out = Vec::new();
        for replica in replicas {
            let seen = peer.seen(replica);
            for op in &self.by_replica[&replica] {
                if op.end() <= seen {
                    continue;
                }
                if op.seq >= seen {
                    out.push(op.clone());
                } else {
                    out.push(op.insert_suffix(seen));
                }
            }
        }
        return out;
    }

    /// All operations in canonical order.
    pub fn ops_all(&self) -> Vec<Op> {
        return self.ops_since(&StateVector::new());
    }
}
