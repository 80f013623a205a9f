//! The per-connection handshake state machine and relay loop.
//!
//! One task serves each client connection. The protocol, server side:
//!
//! 1. `Connecting`: the server announces its state vector.
//! 2. The client replies with its own vector; the server answers with
//!    `diff_since(client_vector)` and the connection is
//!    `VectorExchanged`.
//! 3. The first live fragment (clients follow their vector with any
//!    locally-pending edits) moves the connection to `Live`; fragments
//!    now relay through the session.
//! 4. Transport close or a protocol violation moves to `Closed`, which
//!    always leaves the session.
//!
//! A malformed handshake aborts only the offending connection. A
//! malformed fragment on a live connection is dropped with a `Reject`
//! notice; the connection stays up.

use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::crdt::clock::StateVector;
use crate::error::SyncError;
use crate::sync::registry::Registry;
use crate::sync::session::JoinToken;
use crate::sync::session::Session;
use crate::wire::Message;

/// Connection phases. `Closed` is terminal; no further frames are
/// processed after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    VectorExchanged,
    Live,
    Closed,
}

/// Serve one client connection for `doc` over a duplex frame channel.
///
/// `inbound` carries raw frames read from the transport; frames to write
/// back are pushed to `outbound`. A websocket (or any ordered, framed
/// transport) layer maps frames 1:1 in both directions; the document id
/// arrives out-of-band as connection metadata.
///
/// Returns when the transport closes or the connection aborts. The
/// session is always left on exit, whatever the outcome.
pub async fn serve(
    registry: &Registry,
    doc: &str,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
) -> Result<(), SyncError> {
    let (session, token) = registry.join(doc).await?;
    session.attach(token, outbound);

    let served = run(&session, token, &mut inbound).await;

    session.detach(token);
    let left = registry.leave(doc, token).await;
    return served.and(left);
}

async fn run(
    session: &Session,
    token: JoinToken,
    inbound: &mut mpsc::Receiver<Vec<u8>>,
) -> Result<(), SyncError> {
    // Announce our frontier; the client's reply drives the catch-up.
    let vector = session.state_vector().encode();
    if !session.send_to(token, &Message::SyncVector(vector)) {
        return Err(SyncError::ChannelClosed);
    }

    let mut phase = Phase::Connecting;
    while let Some(frame) = inbound.recv().await {
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(error) => {
                if phase == Phase::Connecting || phase == Phase::VectorExchanged {
                    // A malformed handshake aborts this connection only.
                    warn!(doc = session.doc(), %error, "malformed handshake frame");
                    return Err(error.into());
                }
                debug!(doc = session.doc(), %error, "dropping malformed frame");
                session.send_to(token, &Message::Reject(error.to_string()));
                continue;
            }
        };

        phase = step(session, token, phase, message)?;
        if phase == Phase::Closed {
            break;
        }
    }

    debug!(doc = session.doc(), "connection closed");
    return Ok(());
}

/// Process one typed frame in the given phase, returning the next phase.
fn step(
    session: &Session,
    token: JoinToken,
    phase: Phase,
    message: Message,
) -> Result<Phase, SyncError> {
    match (phase, message) {
        (Phase::Connecting, Message::SyncVector(bytes)) => {
            let peer = StateVector::decode(&bytes)?;
            let diff = session.diff_since(&peer);
            if !session.send_to(token, &Message::SyncDiff(diff)) {
                return Err(SyncError::ChannelClosed);
            }
            debug!(doc = session.doc(), "vectors exchanged, catch-up sent");
            return Ok(Phase::VectorExchanged);
        }
        (Phase::Connecting, _) => {
            return Err(SyncError::Protocol(
                "expected the client state vector before any other traffic",
            ));
        }

        (Phase::VectorExchanged | Phase::Live, Message::Fragment(bytes)) => {
            match session.relay(token, &bytes) {
                Ok(()) => {}
                Err(error) => {
                    // Drop the fragment, notify the sender, stay live.
                    debug!(doc = session.doc(), %error, "rejected fragment");
                    session.send_to(token, &Message::Reject(error.to_string()));
                }
            }
            return Ok(Phase::Live);
        }
        (Phase::VectorExchanged | Phase::Live, Message::SyncVector(_) | Message::SyncDiff(_)) => {
            return Err(SyncError::Protocol("handshake frame on a live connection"));
        }
        (Phase::VectorExchanged | Phase::Live, Message::Reject(reason)) => {
            // Nothing a server can do with a client-side notice but log it.
            warn!(doc = session.doc(), reason, "client rejected a frame");
            return Ok(phase);
        }

        (Phase::Closed, _) => return Ok(Phase::Closed),
    }
}
