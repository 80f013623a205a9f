//! A live document session: the shared replica plus its connections.
//!
//! Exactly one session exists per document id while any client is
//! connected (the registry enforces this). The session owns the broadcast
//! relay: a fragment received from one connection is applied to the shared
//! replica and the raw bytes are forwarded to every other connection.
//!
//! All applies for one document go through the session's replica mutex, so
//! no two merges for the same document ever run concurrently. The mutex is
//! a plain (non-async) lock held only across in-memory work.
//!
//! Outbound channels are bounded. A connection that stops draining its
//! channel is dropped at the next send rather than buffering server memory
//! without bound; the client reconnects and catches up via its vector.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::crdt::clock::StateVector;
use crate::crdt::replica::Replica;
use crate::error::DecodeError;
use crate::wire::Message;

/// Identifies one join of a session. Required to relay fragments and to
/// leave again; the registry rejects unknown tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JoinToken(pub(crate) u64);

/// The shared state for one document.
pub struct Session {
    doc: String,
    replica: Mutex<Replica>,
    /// Outbound frame senders, keyed by join token.
    conns: Mutex<FxHashMap<u64, mpsc::Sender<Vec<u8>>>>,
    next_token: AtomicU64,
}

impl Session {
    pub(crate) fn new(doc: String, replica: Replica) -> Session {
        return Session {
            doc,
            replica: Mutex::new(replica),
            conns: Mutex::new(FxHashMap::default()),
            next_token: AtomicU64::new(0),
        };
    }

    /// The document id this session serves.
    pub fn doc(&self) -> &str {
        return &self.doc;
    }

    pub(crate) fn issue_token(&self) -> JoinToken {
        return JoinToken(self.next_token.fetch_add(1, Ordering::Relaxed));
    }

    /// Register the outbound frame channel for a joined connection.
    pub fn attach(&self, token: JoinToken, tx: mpsc::Sender<Vec<u8>>) {
        self.conns.lock().insert(token.0, tx);
    }

    /// Remove a connection's outbound channel. Idempotent.
    pub fn detach(&self, token: JoinToken) {
        self.conns.lock().remove(&token.0);
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        return self.conns.lock().len();
    }

    /// Apply a fragment from one connection and forward the raw,
    /// unmodified bytes to every other connection.
    ///
    /// The sender never receives its own fragment back. On decode failure
    /// nothing is applied or forwarded; the caller notifies the sender.
    /// Connections whose transport has gone away, or whose outbound buffer
    /// is full (a stalled client), are dropped on the spot.
    pub fn relay(&self, sender: JoinToken, fragment: &[u8]) -> Result<(), DecodeError> {
        self.replica.lock().apply(fragment)?;

        let frame = Message::Fragment(fragment.to_vec()).encode();
        let mut conns = self.conns.lock();
        conns.retain(|token, tx| {
            if *token == sender.0 {
                return true;
            }
            match tx.try_send(frame.clone()) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(doc = self.doc.as_str(), token, "dropping stalled connection");
                    return false;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        });
        debug!(
            doc = self.doc.as_str(),
            bytes = fragment.len(),
            fanout = conns.len().saturating_sub(1),
            "relayed fragment",
        );
        return Ok(());
    }

    /// Send a frame to a single connection. Returns false if the
    /// connection's transport has gone away or its outbound buffer is
    /// full.
    pub fn send_to(&self, token: JoinToken, message: &Message) -> bool {
        let conns = self.conns.lock();
        match conns.get(&token.0) {
            Some(tx) => return tx.try_send(message.encode()).is_ok(),
            None => return false,
        }
    }

    /// The shared replica's causal frontier.
    pub fn state_vector(&self) -> StateVector {
        return self.replica.lock().state_vector();
    }

    /// Operations the peer is missing, as an encoded fragment.
    pub fn diff_since(&self, peer: &StateVector) -> Vec<u8> {
        return self.replica.lock().diff_since(peer);
    }

    /// Full serialized state. Also served synchronously to read-only
    /// collaborators (e.g. a REST display path) via the registry.
    pub fn snapshot(&self) -> Vec<u8> {
        return self.replica.lock().snapshot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::clock::ReplicaId;

    fn session() -> Session {
        return Session::new("doc1".to_string(), Replica::with_id(ReplicaId(0)));
    }

    fn attach_new(session: &Session) -> (JoinToken, mpsc::Receiver<Vec<u8>>) {
        let token = session.issue_token();
        let (tx, rx) = mpsc::channel(8);
        session.attach(token, tx);
        return (token, rx);
    }

    #[test]
    fn relay_applies_to_shared_replica() {
        let session = session();
        let (token, _rx) = attach_new(&session);

        let mut client = Replica::with_id(ReplicaId(1));
        let fragment = client.insert(0, b"hello");
        session.relay(token, &fragment).unwrap();

        let restored = Replica::from_snapshot(&session.snapshot()).unwrap();
        assert_eq!(restored.to_string(), "hello");
    }

    #[test]
    fn relay_forwards_to_everyone_but_the_sender() {
        let session = session();
        let (sender, mut sender_rx) = attach_new(&session);
        let (_, mut other_rx) = attach_new(&session);

        let mut client = Replica::with_id(ReplicaId(1));
        let fragment = client.insert(0, b"hi");
        session.relay(sender, &fragment).unwrap();

        // The other connection receives the raw fragment, framed.
        let frame = other_rx.try_recv().unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::Fragment(fragment));

        // The sender receives nothing.
        assert!(sender_rx.try_recv().is_err());
    }

    #[test]
    fn relay_rejects_malformed_fragment_without_forwarding() {
        let session = session();
        let (sender, _sender_rx) = attach_new(&session);
        let (_, mut other_rx) = attach_new(&session);

        assert!(session.relay(sender, &[0xff, 0xff]).is_err());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn relay_drops_connections_with_closed_transport() {
        let session = session();
        let (sender, _sender_rx) = attach_new(&session);
        let (_, other_rx) = attach_new(&session);
        drop(other_rx);

        let mut client = Replica::with_id(ReplicaId(1));
        let fragment = client.insert(0, b"x");
        session.relay(sender, &fragment).unwrap();

        assert_eq!(session.connection_count(), 1);
    }

    #[test]
    fn relay_drops_connection_whose_buffer_overflows() {
        let session = session();
        let (sender, _sender_rx) = attach_new(&session);

        // A connection that never drains its single-slot buffer.
        let stalled = session.issue_token();
        let (tx, _stalled_rx) = mpsc::channel(1);
        session.attach(stalled, tx);

        let mut client = Replica::with_id(ReplicaId(1));
        let first = client.insert(0, b"a");
        let second = client.insert(1, b"b");

        session.relay(sender, &first).unwrap();
        assert_eq!(session.connection_count(), 2);

        // The buffer is full; the stalled connection is dropped, the
        // session keeps relaying.
        session.relay(sender, &second).unwrap();
        assert_eq!(session.connection_count(), 1);

        let restored = Replica::from_snapshot(&session.snapshot()).unwrap();
        assert_eq!(restored.to_string(), "ab");
    }

    #[test]
    fn detach_is_idempotent() {
        let session = session();
        let (token, _rx) = attach_new(&session);

        session.detach(token);
        session.detach(token);
        assert_eq!(session.connection_count(), 0);
    }

    #[test]
    fn send_to_unknown_token_is_false() {
        let session = session();
        let token = session.issue_token();
        assert!(!session.send_to(token, &Message::Reject("nope".to_string())));
    }
}
