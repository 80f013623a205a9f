//! Binary wire formats: varints, fragments, snapshots, and channel frames.
//!
//! Everything that crosses a channel or a storage boundary is encoded
//! here, so the CRDT core never touches raw bytes directly.
//!
//! Three formats share one operation encoding:
//!
//! - **Fragment**: `varint op_count` followed by operations. Produced by a
//!   local edit or by a state-vector diff; applied by every replica.
//! - **Snapshot**: magic + version byte, a fragment of the full history,
//!   and a blake3 checksum of the fragment. Used for storage seeding and
//!   flush, where silent corruption must be detected on load.
//! - **Frame**: a 1-byte type tag plus payload, the unit a transport
//!   carries. Decoded into a typed [`Message`] at the channel boundary so
//!   the handshake state machine never sees untagged blobs.

use smallvec::SmallVec;

use crate::crdt::clock::ReplicaId;
use crate::crdt::oplog::IdRange;
use crate::crdt::oplog::ItemId;
use crate::crdt::oplog::Op;
use crate::crdt::oplog::OpBody;
use crate::error::DecodeError;

/// Magic bytes prefixing every snapshot.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"CORD";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// Frame tag: state vector (handshake only).
pub const TAG_SYNC_VECTOR: u8 = 0x01;

/// Frame tag: catch-up diff (handshake only).
pub const TAG_SYNC_DIFF: u8 = 0x02;

/// Frame tag: live update fragment.
pub const TAG_FRAGMENT: u8 = 0x03;

/// Frame tag: error notice to the offending sender.
pub const TAG_REJECT: u8 = 0x04;

const OP_KIND_INSERT: u8 = 0x00;
const OP_KIND_DELETE: u8 = 0x01;

// =============================================================================
// Varints
// =============================================================================

/// Append a u64 as an LEB128 varint.
pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// A cursor over input bytes with checked reads.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Reader<'a> {
        return Reader { buf, pos: 0 };
    }

    pub(crate) fn remaining(&self) -> usize {
        return self.buf.len() - self.pos;
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEnd)?;
        self.pos += 1;
        return Ok(byte);
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 0x01 {
                return Err(DecodeError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow);
            }
        }
    }

    pub(crate) fn read_bytes(&mut self, len: u64) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() as u64 {
            return Err(DecodeError::BadLength(len));
        }
        let start = self.pos;
        self.pos += len as usize;
        return Ok(&self.buf[start..self.pos]);
    }

    /// Assert that the input has been fully consumed.
    pub(crate) fn finish(&self) -> Result<(), DecodeError> {
        if self.remaining() != 0 {
            return Err(DecodeError::TrailingBytes);
        }
        return Ok(());
    }
}

// =============================================================================
// Operation encoding
// =============================================================================

fn write_opt_id(out: &mut Vec<u8>, id: Option<ItemId>) {
    match id {
        None => out.push(0),
        Some(id) => {
            out.push(1);
            write_varint(out, id.replica.0);
            write_varint(out, id.seq);
        }
    }
}

fn read_opt_id(reader: &mut Reader<'_>) -> Result<Option<ItemId>, DecodeError> {
    match reader.read_u8()? {
        0 => return Ok(None),
        _ => {
            let replica = ReplicaId(reader.read_varint()?);
            let seq = reader.read_varint()?;
            return Ok(Some(ItemId::new(replica, seq)));
        }
    }
}

fn write_op(out: &mut Vec<u8>, op: &Op) {
    write_varint(out, op.replica.0);
    write_varint(out, op.seq);
    match &op.body {
        OpBody::Insert {
            left,
            right,
            content,
        } => {
            out.push(OP_KIND_INSERT);
            write_opt_id(out, *left);
            write_opt_id(out, *right);
            write_varint(out, content.len() as u64);
            out.extend_from_slice(content);
        }
        OpBody::Delete { targets } => {
            out.push(OP_KIND_DELETE);
            write_varint(out, targets.len() as u64);
            for range in targets {
                write_varint(out, range.replica.0);
                write_varint(out, range.start);
                write_varint(out, range.len);
            }
        }
    }
}

fn read_op(reader: &mut Reader<'_>) -> Result<Op, DecodeError> {
    let replica = ReplicaId(reader.read_varint()?);
    let seq = reader.read_varint()?;
    let kind = reader.read_u8()?;
    match kind {
        OP_KIND_INSERT => {
            let left = read_opt_id(reader)?;
            let right = read_opt_id(reader)?;
            let len = reader.read_varint()?;
            if len == 0 {
                return Err(DecodeError::EmptyInsert);
            }
            let content = reader.read_bytes(len)?.to_vec();
            return Ok(Op {
                replica,
                seq,
                body: OpBody::Insert {
                    left,
                    right,
                    content,
                },
            });
        }
        OP_KIND_DELETE => {
            let count = reader.read_varint()?;
            // Each range is at least three bytes.
            if count > reader.remaining() as u64 {
                return Err(DecodeError::BadLength(count));
            }
            let mut targets = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let replica = ReplicaId(reader.read_varint()?);
                let start = reader.read_varint()?;
                let len = reader.read_varint()?;
                targets.push(IdRange {
                    replica,
                    start,
                    len,
                });
            }
            return Ok(Op {
                replica,
                seq,
                body: OpBody::Delete { targets },
            });
        }
        other => return Err(DecodeError::UnknownOpKind(other)),
    }
}

/// Encode a set of operations as an update fragment.
pub fn encode_fragment(ops: &[Op]) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, ops.len() as u64);
    for op in ops {
        write_op(&mut out, op);
    }
    return out;
}

/// Decode an update fragment.
pub fn decode_fragment(bytes: &[u8]) -> Result<SmallVec<[Op; 2]>, DecodeError> {
    let mut reader = Reader::new(bytes);
    let count = reader.read_varint()?;
    // Each op is at least three bytes.
    if count > bytes.len() as u64 {
        return Err(DecodeError::BadLength(count));
    }

    let mut ops = SmallVec::new();
    for _ in 0..count {
        ops.push(read_op(&mut reader)?);
    }
    reader.finish()?;
    return Ok(ops);
}

// =============================================================================
// Snapshots
// =============================================================================

/// Wrap an encoded fragment as a durable snapshot: magic, version,
/// payload, blake3 checksum of the payload.
pub fn encode_snapshot(fragment: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fragment.len() + 37);
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.push(SNAPSHOT_VERSION);
    out.extend_from_slice(fragment);
    out.extend_from_slice(blake3::hash(fragment).as_bytes());
    return out;
}

/// Unwrap a snapshot, verifying magic, version, and checksum. Returns the
/// fragment payload.
pub fn decode_snapshot(bytes: &[u8]) -> Result<&[u8], DecodeError> {
    if bytes.len() < 5 + 32 {
        return Err(DecodeError::UnexpectedEnd);
    }
    if bytes[..4] != SNAPSHOT_MAGIC {
        return Err(DecodeError::BadMagic);
    }
    if bytes[4] != SNAPSHOT_VERSION {
        return Err(DecodeError::UnsupportedVersion(bytes[4]));
    }

    let payload = &bytes[5..bytes.len() - 32];
    let checksum = &bytes[bytes.len() - 32..];
    if blake3::hash(payload).as_bytes() != checksum {
        return Err(DecodeError::ChecksumMismatch);
    }
    return Ok(payload);
}

// =============================================================================
// Channel frames
// =============================================================================

/// A typed channel frame.
///
/// Handshake frames (`SyncVector`, `SyncDiff`) are only valid before a
/// connection goes live; `Fragment` carries live updates; `Reject` tells a
/// sender its last fragment was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// The sender's state vector, encoded.
    SyncVector(Vec<u8>),
    /// A catch-up fragment computed from the receiver's state vector.
    SyncDiff(Vec<u8>),
    /// A live update fragment, forwarded verbatim.
    Fragment(Vec<u8>),
    /// Error notice: the receiver's last fragment was rejected.
    Reject(String),
}

impl Message {
    /// Encode as a tagged frame.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, payload) = match self {
            Message::SyncVector(bytes) => (TAG_SYNC_VECTOR, bytes.as_slice()),
            Message::SyncDiff(bytes) => (TAG_SYNC_DIFF, bytes.as_slice()),
            Message::Fragment(bytes) => (TAG_FRAGMENT, bytes.as_slice()),
            Message::Reject(reason) => (TAG_REJECT, reason.as_bytes()),
        };
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(tag);
        out.extend_from_slice(payload);
        return out;
    }

    /// Decode a tagged frame. The payload itself is decoded later, by
    /// whoever consumes the message.
    pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
        let (tag, payload) = frame.split_first().ok_or(DecodeError::UnexpectedEnd)?;
        match *tag {
            TAG_SYNC_VECTOR => return Ok(Message::SyncVector(payload.to_vec())),
            TAG_SYNC_DIFF => return Ok(Message::SyncDiff(payload.to_vec())),
            TAG_FRAGMENT => return Ok(Message::Fragment(payload.to_vec())),
            TAG_REJECT => {
                let reason = std::str::from_utf8(payload)
                    .map_err(|_| DecodeError::BadUtf8)?
                    .to_string();
                return Ok(Message::Reject(reason));
            }
            other => return Err(DecodeError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_roundtrip(value: u64) -> u64 {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, value);
        return Reader::new(&bytes).read_varint().unwrap();
    }

    #[test]
    fn varint_roundtrips() {
        for value in [0, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            assert_eq!(varint_roundtrip(value), value);
        }
    }

    #[test]
    fn varint_rejects_overflow() {
        // Eleven continuation bytes cannot fit in a u64.
        let bytes = [0xff; 11];
        assert_eq!(
            Reader::new(&bytes).read_varint(),
            Err(DecodeError::VarintOverflow)
        );
    }

    #[test]
    fn varint_rejects_truncation() {
        let bytes = [0x80];
        assert_eq!(
            Reader::new(&bytes).read_varint(),
            Err(DecodeError::UnexpectedEnd)
        );
    }

    fn sample_ops() -> Vec<Op> {
        return vec![
            Op {
                replica: ReplicaId(1),
                seq: 0,
                body: OpBody::Insert {
                    left: None,
                    right: Some(ItemId::new(ReplicaId(2), 7)),
                    content: b"hello".to_vec(),
                },
            },
            Op {
                replica: ReplicaId(1),
                seq: 5,
                body: OpBody::Delete {
                    targets: vec![
                        IdRange {
                            replica: ReplicaId(2),
                            start: 3,
                            len: 4,
                        },
                        IdRange {
                            replica: ReplicaId(1),
                            start: 0,
                            len: 2,
                        },
                    ],
                },
            },
        ];
    }

    #[test]
    fn fragment_roundtrips() {
        let ops = sample_ops();
        let bytes = encode_fragment(&ops);
        let decoded = decode_fragment(&bytes).unwrap();
        assert_eq!(decoded.as_slice(), ops.as_slice());
    }

    #[test]
    fn empty_fragment_roundtrips() {
        let bytes = encode_fragment(&[]);
        assert!(decode_fragment(&bytes).unwrap().is_empty());
    }

    #[test]
    fn fragment_rejects_trailing_bytes() {
        let mut bytes = encode_fragment(&sample_ops());
        bytes.push(0xaa);
        assert_eq!(
            decode_fragment(&bytes),
            Err(DecodeError::TrailingBytes)
        );
    }

    #[test]
    fn fragment_rejects_empty_insert() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, 1);
        write_varint(&mut bytes, 1); // replica
        write_varint(&mut bytes, 0); // seq
        bytes.push(OP_KIND_INSERT);
        bytes.push(0); // no left origin
        bytes.push(0); // no right origin
        write_varint(&mut bytes, 0); // empty content
        assert_eq!(decode_fragment(&bytes), Err(DecodeError::EmptyInsert));
    }

    #[test]
    fn fragment_rejects_unknown_op_kind() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, 1);
        write_varint(&mut bytes, 1);
        write_varint(&mut bytes, 0);
        bytes.push(0x7e);
        assert_eq!(
            decode_fragment(&bytes),
            Err(DecodeError::UnknownOpKind(0x7e))
        );
    }

    #[test]
    fn snapshot_roundtrips() {
        let fragment = encode_fragment(&sample_ops());
        let snapshot = encode_snapshot(&fragment);
        assert_eq!(decode_snapshot(&snapshot).unwrap(), fragment.as_slice());
    }

    #[test]
    fn snapshot_rejects_bad_magic() {
        let mut snapshot = encode_snapshot(b"payload");
        snapshot[0] = b'X';
        assert_eq!(decode_snapshot(&snapshot), Err(DecodeError::BadMagic));
    }

    #[test]
    fn snapshot_rejects_unknown_version() {
        let mut snapshot = encode_snapshot(b"payload");
        snapshot[4] = 99;
        assert_eq!(
            decode_snapshot(&snapshot),
            Err(DecodeError::UnsupportedVersion(99))
        );
    }

    #[test]
    fn snapshot_rejects_corrupt_payload() {
        let mut snapshot = encode_snapshot(b"payload");
        snapshot[6] ^= 0xff;
        assert_eq!(
            decode_snapshot(&snapshot),
            Err(DecodeError::ChecksumMismatch)
        );
    }

    #[test]
    fn snapshot_rejects_truncation() {
        let snapshot = encode_snapshot(b"payload");
        assert_eq!(
            decode_snapshot(&snapshot[..10]),
            Err(DecodeError::UnexpectedEnd)
        );
    }

    #[test]
    fn message_roundtrips() {
        let messages = vec![
            Message::SyncVector(vec![1, 2, 3]),
            Message::SyncDiff(vec![]),
            Message::Fragment(vec![0xff; 8]),
            Message::Reject("bad fragment".to_string()),
        ];
        for message in messages {
            assert_eq!(Message::decode(&message.encode()).unwrap(), message);
        }
    }

    #[test]
    fn message_rejects_empty_frame() {
        assert_eq!(Message::decode(&[]), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn message_rejects_unknown_tag() {
        assert_eq!(
            Message::decode(&[0x7f, 1, 2]),
            Err(DecodeError::UnknownTag(0x7f))
        );
    }

    #[test]
    fn message_rejects_non_utf8_notice() {
        assert_eq!(
            Message::decode(&[TAG_REJECT, 0xff, 0xfe]),
            Err(DecodeError::BadUtf8)
        );
    }
}
