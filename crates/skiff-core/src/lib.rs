//! Shared core for skiff: end-to-end-encrypted remote task execution.
//!
//! A low-trust client submits one task per session to a compute node
//! through a rendezvous relay. The pieces here are role-agnostic: the
//! per-session hybrid crypto, the wire protocol, the protocol state
//! machine, the relay signaling client, and the transport abstraction
//! with its WebRTC and in-process implementations. The binaries in
//! `apps/` wire these into the client and compute-node roles.

pub mod crypto;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transport;
