//! BFD control packet codec
//!
//! Bit-exact serialization and parsing of the 24-byte BFD control header
//! (RFC 5880 section 4.1) and its optional authentication section. This
//! crate is pure: no sockets, no timers, no state.

pub mod auth;
pub mod control;

pub use auth::{AuthenticationSection, SimplePassword};
pub use control::{ControlPacket, BFD_CONTROL_PORT, MAXIMUM_SIZE, MINIMUM_SIZE};
