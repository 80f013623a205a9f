//! Concord - the real-time synchronization core for a collaborative
//! document editor.
//!
//! N concurrent clients edit the same document and converge to an
//! identical state without a central lock and without losing edits, even
//! when they are not online simultaneously. The engine is a state-based
//! CRDT (YATA ordering, per-replica sequence numbers) wrapped in a
//! session layer: a registry of live documents, a broadcast relay, and a
//! state-vector handshake that sends reconnecting clients exactly the
//! operations they are missing.
//!
//! # Quick Start
//!
//! ```
//! use concord::crdt::replica::Replica;
//!
//! let mut alice = Replica::new();
//! let mut bob = Replica::new();
//!
//! // Local edits produce binary fragments to transmit.
//! let hello = alice.insert(0, b"Hello");
//! bob.apply(&hello).unwrap();
//!
//! let world = bob.insert(5, b" world");
//! alice.apply(&world).unwrap();
//!
//! assert_eq!(alice.to_string(), "Hello world");
//! assert_eq!(bob.to_string(), "Hello world");
//! ```

pub mod crdt;
pub mod error;
pub mod sync;
pub mod wire;
