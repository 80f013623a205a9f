//! Session lifecycle, broadcast relay, and the connection handshake.

pub mod handshake;
pub mod registry;
pub mod session;
