//! Error taxonomy for the synchronization core.
//!
//! Three failure classes with very different blast radii:
//!
//! - [`DecodeError`]: malformed bytes arrived from a peer. The input is
//!   dropped and the offending sender is notified; the connection and the
//!   session carry on.
//! - [`StorageError`]: the snapshot collaborator failed. A load failure
//!   surfaces as a join failure; a flush failure is retried in the
//!   background and never blocks client traffic.
//! - [`SyncError`]: everything a session-layer call can return.

use thiserror::Error;

/// A fragment, state vector, snapshot, or channel frame failed to decode.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input ended before the structure was complete.
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// A channel frame carried an unknown type tag.
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),

    /// An operation carried an unknown kind byte.
    #[error("unknown operation kind {0:#04x}")]
    UnknownOpKind(u8),

    /// A varint ran past the width of a u64.
    #[error("varint overflows u64")]
    VarintOverflow,

    /// A declared length exceeds the remaining input.
    #[error("declared length {0} exceeds remaining input")]
    BadLength(u64),

    /// An insert operation with no content. Such an operation consumes no
    /// sequence numbers and can never be deduplicated, so it is rejected
    /// at the boundary.
    #[error("insert operation with empty content")]
    EmptyInsert,

    /// Leftover bytes after a complete structure.
    #[error("trailing bytes after payload")]
    TrailingBytes,

    /// A snapshot did not start with the expected magic bytes.
    #[error("bad snapshot magic")]
    BadMagic,

    /// A snapshot from an unknown format version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),

    /// A snapshot whose payload does not match its checksum.
    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,

    /// A reject notice that was not valid UTF-8.
    #[error("invalid utf-8 in reject notice")]
    BadUtf8,
}

/// Failure reported by the snapshot storage collaborator.
#[derive(Clone, Debug, Error)]
#[error("storage: {0}")]
pub struct StorageError(pub String);

/// Errors returned by the session layer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A document id / join token pair that is not currently registered.
    /// This is a caller bug, fatal to the call but never to the process.
    #[error("no session registered for document {doc:?} with this token")]
    UnknownSession { doc: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The transport channel for this connection has gone away.
    #[error("transport channel closed")]
    ChannelClosed,

    /// The peer sent a frame that is not valid in the current handshake
    /// phase. Aborts this connection only.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}
