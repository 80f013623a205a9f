//! The replica state container: merged document state for one document.
//!
//! Integration uses the YATA algorithm (the approach behind yjs, one of
//! the most widely deployed CRDTs). Each inserted run remembers both its
//! left origin (what it was inserted after) and its right origin (what was
//! to its right at insertion time); these immutable origins make
//! concurrent-insert ordering deterministic and prevent interleaving.
//!
//! On top of the ordering rules sits fragment-based delivery: operations
//! arrive over the network in any order, so the container parks operations
//! whose causal dependencies have not landed yet and retries them as later
//! fragments fill the gaps. Applying the same fragment twice is a no-op,
//! and applying a fragment set in any order converges to the same state.
//!
//! Storage is a flat Vec of items in document order. Random access is
//! O(n), which is fine here: correctness is the priority, and documents in
//! a live session are edited a few bytes at a time.
//!
//! # Example
//!
//! ```
//! use concord::crdt::replica::Replica;
//!
//! let mut alice = Replica::new();
//! let mut bob = Replica::new();
//!
//! let hello = alice.insert(0, b"Hello");
//! bob.apply(&hello).unwrap();
//!
//! let world = bob.insert(5, b" world");
//! alice.apply(&world).unwrap();
//!
//! assert_eq!(alice.to_string(), "Hello world");
//! assert_eq!(bob.to_string(), "Hello world");
//! ```

use rustc_hash::FxHashSet;

use crate::crdt::Crdt;
use crate::crdt::clock::ReplicaId;
use crate::crdt::clock::StateVector;
use crate::crdt::oplog::IdRange;
use crate::crdt::oplog::ItemId;
use crate::crdt::oplog::Op;
use crate::crdt::oplog::OpBody;
use crate::crdt::oplog::OpLog;
use crate::error::DecodeError;
use crate::wire;

// =============================================================================
// Item
// =============================================================================

/// An item in the document: a contiguous run of bytes inserted by one
/// replica, possibly split by later edits, possibly tombstoned.
#[derive(Clone, Debug)]
struct Item {
    /// Replica that inserted this run.
    replica: ReplicaId,
    /// Sequence number of the first byte.
    seq: u64,
    /// Number of bytes in the run.
    len: u64,

    /// What was to the left at insertion time. None = document start.
    left_origin: Option<ItemId>,
    /// What was to the right at insertion time. None = document end.
    right_origin: Option<ItemId>,

    /// Content bytes, stored inline.
    content: Vec<u8>,
    /// Tombstone flag. Deleted items keep their place for ordering.
    deleted: bool,
}

impl Item {
    fn new(
        replica: ReplicaId,
        seq: u64,
        content: Vec<u8>,
        left_origin: Option<ItemId>,
        right_origin: Option<ItemId>,
    ) -> Item {
        let len = content.len() as u64;
        return Item {
            replica,
            seq,
            len,
            left_origin,
            right_origin,
            content,
            deleted: false,
        };
    }

    /// Check if this item contains the given (replica, seq).
    fn contains(&self, replica: ReplicaId, seq: u64) -> bool {
        return self.replica == replica && seq >= self.seq && seq < self.seq + self.len;
    }

    /// Visible length (0 if tombstoned).
    fn visible_len(&self) -> u64 {
        if self.deleted {
            return 0;
        }
        return self.len;
    }

    /// Split at `offset`, returning the right part.
    ///
    /// After the split, self covers [0, offset) and the returned item
    /// covers [offset, len). The right part's left origin becomes the last
    /// byte of the left part; both keep the original right origin (an
    /// insertion-time property).
    fn split(&mut self, offset: u64) -> Item {
        debug_assert!(offset > 0 && offset < self.len);

        let right = Item {
            replica: self.replica,
            seq: self.seq + offset,
            len: self.len - offset,
            left_origin: Some(ItemId::new(self.replica, self.seq + offset - 1)),
            right_origin: self.right_origin,
            content: self.content[offset as usize..].to_vec(),
            deleted: self.deleted,
        };

        self.len = offset;
        self.content.truncate(offset as usize);

        return right;
    }
}

/// Outcome of attempting to integrate one operation.
enum Outcome {
    /// Integrated into the document.
    Applied,
    /// Already fully contained; dropped.
    Duplicate,
    /// Causal dependencies missing; parked for retry.
    Deferred(Op),
}

// =============================================================================
// Replica
// =============================================================================

/// The authoritative merged state for one document.
///
/// Holds the materialized item list (for ordering and rendering), the
/// causal update log (for diffing and snapshots), the state vector (for
/// dedup and handshakes), and a pending set of operations whose causal
/// dependencies have not arrived yet.
///
/// Purely in-memory; never performs I/O.
#[derive(Clone, Debug)]
pub struct Replica {
    /// This replica's identity, used for locally produced operations.
    id: ReplicaId,
    /// Items in document order.
    items: Vec<Item>,
    /// Every integrated operation.
    log: OpLog,
    /// Sequence numbers integrated so far.
    vector: StateVector,
    /// Operations waiting on missing causal dependencies.
    pending: Vec<Op>,
}

impl Default for Replica {
    fn default() -> Self {
        return Self::new();
    }
}

impl Replica {
    /// Create an empty replica with a random id.
    pub fn new() -> Replica {
        return Replica::with_id(ReplicaId::generate());
    }

    /// Create an empty replica with a fixed id. Ids must be unique across
    /// the replicas of one document.
    pub fn with_id(id: ReplicaId) -> Replica {
        return Replica {
            id,
            items: Vec::new(),
            log: OpLog::new(),
            vector: StateVector::new(),
            pending: Vec::new(),
        };
    }

    /// Rebuild a replica from a snapshot, under a fresh random id.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Replica, DecodeError> {
        let payload = wire::decode_snapshot(bytes)?;
        let ops = wire::decode_fragment(payload)?;
        let mut replica = Replica::new();
        replica.integrate_ops(ops.into_vec());
        return Ok(replica);
    }

    /// This replica's id.
    pub fn id(&self) -> ReplicaId {
        return self.id;
    }

    // =========================================================================
    // Merge primitives
    // =========================================================================

    /// Decode a fragment and merge its operations.
    ///
    /// Operations already contained are skipped silently. Operations whose
    /// causal dependencies are missing are parked and retried as later
    /// fragments land. Malformed bytes leave the state untouched.
    pub fn apply(&mut self, fragment: &[u8]) -> Result<(), DecodeError> {
        let ops = wire::decode_fragment(fragment)?;
        self.integrate_ops(ops.into_vec());
        return Ok(());
    }

    /// The current causal frontier.
    pub fn state_vector(&self) -> StateVector {
        return self.vector.clone();
    }

    /// The minimal fragment containing every operation this container has
    /// that the peer's vector does not.
    pub fn diff_since(&self, peer: &StateVector) -> Vec<u8> {
        return wire::encode_fragment(&self.log.ops_since(peer));
    }

    /// Full serialized state, for seeding new sessions and flushing to
    /// storage. Equal histories produce byte-identical snapshots.
    pub fn snapshot(&self) -> Vec<u8> {
        let fragment = wire::encode_fragment(&self.log.ops_all());
        return wire::encode_snapshot(&fragment);
    }

    /// Number of operations parked on missing causal dependencies.
    pub fn pending_ops(&self) -> usize {
        return self.pending.len();
    }

    // =========================================================================
    // Local editing
    // =========================================================================

    /// Insert bytes at a visible position, returning the encoded fragment
    /// to transmit. Positions past the end clamp to the end.
    pub fn insert(&mut self, pos: u64, content: &[u8]) -> Vec<u8> {
        if content.is_empty() {
            return wire::encode_fragment(&[]);
        }

        let doc_len = self.len();
        let pos = pos.min(doc_len);

        let left = if pos == 0 {
            None
        } else {
            self.id_at_pos(pos - 1)
        };
        let right = if pos >= doc_len {
            None
        } else {
            self.id_at_pos(pos)
        };

        let op = Op {
            replica: self.id,
            seq: self.vector.seen(self.id),
            body: OpBody::Insert {
                left,
                right,
                content: content.to_vec(),
            },
        };
        let fragment = wire::encode_fragment(std::slice::from_ref(&op));
        self.integrate_ops(vec![op]);
        return fragment;
    }

    /// Delete a range of visible positions, returning the encoded fragment
    /// to transmit. Ranges past the end clamp to the end.
    pub fn delete(&mut self, pos: u64, len: u64) -> Vec<u8> {
        let targets = self.visible_ranges(pos, len);
        if targets.is_empty() {
            return wire::encode_fragment(&[]);
        }

        let op = Op {
            replica: self.id,
            seq: self.vector.seen(self.id),
            body: OpBody::Delete { targets },
        };
        let fragment = wire::encode_fragment(std::slice::from_ref(&op));
        self.integrate_ops(vec![op]);
        return fragment;
    }

    /// Render the visible document as a string.
    #[allow(clippy::inherent_to_string)]
    pub fn to_string(&self) -> String {
        let mut bytes = Vec::new();
        for item in &self.items {
            if !item.deleted {
                bytes.extend_from_slice(&item.content);
            }
        }
        return String::from_utf8_lossy(&bytes).into_owned();
    }

    /// Visible length in bytes.
    pub fn len(&self) -> u64 {
        let mut len: u64 = 0;
        for item in &self.items {
            len += item.visible_len();
        }
        return len;
    }

    /// Check if the visible document is empty.
    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    // =========================================================================
    // Integration
    // =========================================================================

    /// Integrate a batch of operations, retrying parked operations until
    /// no further progress is possible.
    fn integrate_ops(&mut self, incoming: Vec<Op>) {
        let mut queue = std::mem::take(&mut self.pending);
        queue.extend(incoming);

        loop {
            let mut progressed = false;
            let mut deferred = Vec::new();

            for op in queue {
                match self.try_integrate(op) {
                    Outcome::Applied => progressed = true,
                    Outcome::Duplicate => {}
                    Outcome::Deferred(op) => deferred.push(op),
                }
            }

            if !progressed || deferred.is_empty() {
                self.pending = deferred;
                return;
            }
            queue = deferred;
        }
    }

    /// Attempt to integrate one operation.
    ///
    /// Readiness rules:
    /// - an operation fully behind the frontier is a duplicate;
    /// - an operation past the frontier (a per-replica gap) is deferred;
    /// - an insert whose origins are unseen, or a delete whose targets are
    ///   unseen, is deferred;
    /// - an insert overlapping the frontier is sliced to its unseen
    ///   suffix first.
    fn try_integrate(&mut self, op: Op) -> Outcome {
        let seen = self.vector.seen(op.replica);
        if op.end() <= seen {
            return Outcome::Duplicate;
        }
        if op.seq > seen {
            return Outcome::Deferred(op);
        }

        let op = if op.seq < seen {
            // Only inserts span multiple sequence numbers.
            op.insert_suffix(seen)
        } else {
            op
        };

        match &op.body {
            OpBody::Insert { left, right, .. } => {
                if !self.origin_seen(*left) || !self.origin_seen(*right) {
                    return Outcome::Deferred(op);
                }
            }
            OpBody::Delete { targets } => {
                for range in targets {
                    if self.vector.seen(range.replica) < range.end() {
                        return Outcome::Deferred(op);
                    }
                }
            }
        }

        match &op.body {
            OpBody::Insert {
                left,
                right,
                content,
            } => {
                let item = Item::new(op.replica, op.seq, content.clone(), *left, *right);
                self.insert_item(item);
            }
            OpBody::Delete { targets } => {
                for range in targets {
                    self.apply_deletion_range(*range);
                }
            }
        }

        self.vector.observe(op.replica, op.end());
        self.log.push(op);
        return Outcome::Applied;
    }

    /// Check whether an origin's sequence number has been integrated.
    fn origin_seen(&self, origin: Option<ItemId>) -> bool {
        match origin {
            None => return true,
            Some(id) => return self.vector.contains(id.replica, id.seq),
        }
    }

    /// Insert an item using the Yjs integration algorithm:
    /// 1. Find the left origin's position.
    /// 2. Scan the conflict window up to the right origin, tracking which
    ///    scanned items could still end up to our right.
    /// 3. Insert at the resolved position.
    ///
    /// The scan reasons about origin IDENTITY, never about current
    /// positions: a scanned item pushes the insertion point right only
    /// when it is a lower-replica sibling, or when its own origin lies in
    /// the already-decided part of the window. Position-independent rules
    /// are what keep the outcome identical across every delivery order the
    /// pending-op retry loop can produce.
    fn insert_item(&mut self, item: Item) {
        if self.items.is_empty() {
            self.items.push(item);
            return;
        }

        // Find left origin position, splitting if it lands mid-item.
        let start_idx = match item.left_origin {
            None => 0,
            Some(origin) => match self.find_item_by_id(origin) {
                Some((idx, offset)) => {
                    if offset < self.items[idx].len - 1 {
                        let right = self.items[idx].split(offset + 1);
                        self.items.insert(idx + 1, right);
                    }
                    idx + 1
                }
                // Origin not materialized (its seq was consumed by a
                // non-insert); fall back to the document start. Every
                // replica falls back identically, so order still agrees.
                None => 0,
            },
        };

        // Find right origin position: the boundary we cannot cross.
        let end_idx = match item.right_origin {
            None => self.items.len(),
            Some(origin) => match self.find_item_by_id(origin) {
                Some((idx, offset)) => {
                    if offset > 0 {
                        let right = self.items[idx].split(offset);
                        self.items.insert(idx + 1, right);
                        idx + 1
                    } else {
                        idx
                    }
                }
                None => self.items.len(),
            },
        };

        // Conflict resolution scan between the origins. Scanned items are
        // keyed by their last byte: a left origin always points at a byte
        // that ends an item (integration splits guarantee it), so origin
        // membership in these sets is an exact id lookup.
        let mut insert_idx = start_idx;
        let mut scanned: FxHashSet<ItemId> = FxHashSet::default();
        let mut undecided: FxHashSet<ItemId> = FxHashSet::default();

        let mut i = start_idx;
        while i < end_idx {
            let existing = &self.items[i];
            let existing_last = ItemId::new(existing.replica, existing.seq + existing.len - 1);
            scanned.insert(existing_last);
            undecided.insert(existing_last);

            if existing.left_origin == item.left_origin {
                // Sibling with the same left origin: the lower replica id
                // goes first.
                if existing.replica < item.replica {
                    insert_idx = i + 1;
                    undecided.clear();
                } else if existing.right_origin == item.right_origin {
                    // Same origins on both sides and a higher replica id:
                    // every later sibling sorts after us too.
                    break;
                }
            } else if let Some(origin) = existing.left_origin
                && scanned.contains(&origin)
            {
                // Existing descends from an item inside the window. It
                // stays to our left only if its ancestor already does.
                if !undecided.contains(&origin) {
                    insert_idx = i + 1;
                    undecided.clear();
                }
            } else {
                // Existing descends from before the window; it and
                // everything after it stay to our right.
                break;
            }
            i += 1;
        }

        self.items.insert(insert_idx, item);
    }

    /// Tombstone a contiguous id range, splitting items as needed.
    fn apply_deletion_range(&mut self, range: IdRange) {
        let start_seq = range.start;
        let end_seq = range.end();
        let mut i = 0;

        while i < self.items.len() {
            let item = &self.items[i];

            if item.replica != range.replica {
                i += 1;
                continue;
            }

            let item_seq = item.seq;
            let item_end = item_seq + item.len;
            if item_seq >= end_seq || item_end <= start_seq {
                i += 1;
                continue;
            }

            let overlap_start = start_seq.max(item_seq);
            let overlap_end = end_seq.min(item_end);

            if overlap_start == item_seq && overlap_end == item_end {
                // Entire item is in the deletion range.
                self.items[i].deleted = true;
                i += 1;
            } else if overlap_start == item_seq {
                // Deletion covers the prefix.
                let right = self.items[i].split(overlap_end - item_seq);
                self.items[i].deleted = true;
                self.items.insert(i + 1, right);
                i += 2;
            } else if overlap_end == item_end {
                // Deletion covers the suffix.
                let mut right = self.items[i].split(overlap_start - item_seq);
                right.deleted = true;
                self.items.insert(i + 1, right);
                i += 2;
            } else {
                // Deletion is in the middle: split twice.
                let mut mid = self.items[i].split(overlap_start - item_seq);
                let right = mid.split(overlap_end - overlap_start);
                mid.deleted = true;
                self.items.insert(i + 1, mid);
                self.items.insert(i + 2, right);
                i += 3;
            }
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Find the item containing the given id.
    /// Returns (item_index, offset_within_item).
    fn find_item_by_id(&self, id: ItemId) -> Option<(usize, u64)> {
        for (i, item) in self.items.iter().enumerate() {
            if item.contains(id.replica, id.seq) {
                return Some((i, id.seq - item.seq));
            }
        }
        return None;
    }

    /// Find the item at a visible position.
    /// Returns (item_index, offset_within_item).
    fn find_item_at_pos(&self, pos: u64) -> Option<(usize, u64)> {
        let mut current: u64 = 0;
        for (i, item) in self.items.iter().enumerate() {
            let visible = item.visible_len();
            if visible == 0 {
                continue;
            }
            if current + visible > pos {
                return Some((i, pos - current));
            }
            current += visible;
        }
        return None;
    }

    /// The id of the byte at a visible position.
    fn id_at_pos(&self, pos: u64) -> Option<ItemId> {
        let (idx, offset) = self.find_item_at_pos(pos)?;
        let item = &self.items[idx];
        return Some(ItemId::new(item.replica, item.seq + offset));
    }

    /// Collect the id ranges covering visible positions [pos, pos + len),
    /// merging runs that are contiguous in both document and id space.
    fn visible_ranges(&self, pos: u64, len: u64) -> Vec<IdRange> {
        let end = pos.saturating_add(len);
        let mut out: Vec<IdRange> = Vec::new();
        let mut current: u64 = 0;

        for item in &self.items {
            let visible = item.visible_len();
            if visible == 0 {
                continue;
            }
            let item_start = current;
            let item_end = current + visible;
            current = item_end;

            if item_end <= pos {
                continue;
            }
            if item_start >= end {
                break;
            }

            let from = pos.max(item_start) - item_start;
            let to = end.min(item_end) - item_start;
            let start_seq = item.seq + from;
            let run_len = to - from;

            if let Some(last) = out.last_mut()
                && last.replica == item.replica
                && last.end() == start_seq
            {
                last.len += run_len;
                continue;
            }
            out.push(IdRange {
                replica: item.replica,
                start: start_seq,
                len: run_len,
            });
        }
        return out;
    }
}

impl Crdt for Replica {
    /// Merge by fragment exchange: pull exactly what `other` has that we
    /// do not.
    fn merge(&mut self, other: &Self) {
        let diff = other.diff_since(&self.vector);
        // A fragment we encoded ourselves always decodes.
        let ops = wire::decode_fragment(&diff).unwrap_or_default();
        self.integrate_ops(ops.into_vec());
    }
}
