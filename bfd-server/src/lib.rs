//! BFD session engine
//!
//! This crate contains the moving parts of the daemon:
//!
//! - [`PeerState`]: immutable snapshot of one side of a session
//! - [`Watcher`]: lossless fan-out of session state transitions
//! - [`Session`]: one BFD session with its transmit socket, timers and
//!   state machine
//! - [`BfdServer`]: the discriminator registry, listening sockets and
//!   packet dispatcher
//! - [`AdminApi`]: the administrative surface (add/update/delete/enable/
//!   disable/list/monitor)
//!
//! The concurrency model is one receive task per listening socket, one
//! dispatch task per server, and two tasks per session (management mailbox
//! and timing loop), plus one drain task per watcher. All mutation of a
//! session's snapshots is serialized through its mailbox.

pub mod admin;
pub mod peer_state;
pub mod server;
pub mod session;
mod ttl;
pub mod watcher;

pub use admin::{AdminApi, PeerEntry, UpdatePeerSpec};
pub use peer_state::{PeerState, PeerStateUpdate};
pub use server::{BfdServer, PeerSpec};
pub use session::{Session, OFFLINE_TIMEOUT};
pub use watcher::{StateChange, Watcher};
