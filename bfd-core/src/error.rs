//! Error types for BFD-RS

use thiserror::Error;

/// Result type alias for BFD operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for BFD-RS
///
/// Packet-level variants cause the offending packet to be dropped and the
/// receive path to continue; administrative variants are surfaced to the
/// caller of the admin interface. No error crosses a session boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet is shorter than 24 bytes or disagrees with its length field
    #[error("Invalid packet length")]
    InvalidPacketLength,

    /// Protocol version is not 1
    #[error("Invalid version")]
    InvalidVersion,

    /// Received detect multiplier is zero
    #[error("Invalid detect multiplier")]
    InvalidDetectMultiplier,

    /// Multipoint bit is set
    #[error("Invalid multipoint value")]
    InvalidMultiPoint,

    /// My Discriminator field is zero
    #[error("Invalid my discriminator value")]
    InvalidMyDiscriminator,

    /// Your Discriminator is zero while the state is neither Down nor AdminDown
    #[error("Invalid your discriminator (=0) for state")]
    InvalidYourDiscriminator,

    /// Authentication type mismatch or unsupported authentication type
    #[error("Authentication type is invalid")]
    InvalidAuthenticationType,

    /// Received TTL differs from 255
    #[error("Invalid TTL received: {0}")]
    InvalidTtl(u8),

    /// No session registered under the Your Discriminator value
    #[error("Discarded packet: your discriminator {0} not found")]
    YourDiscriminatorNotFound(u32),

    /// No session matches the lookup (peer address or uuid)
    #[error("Unable to find peer")]
    PeerNotFound,

    /// The session is administratively down and discards all packets
    #[error("Peer state is admin down")]
    SessionAdminDown,

    /// Peer address did not parse
    #[error("Invalid address passed")]
    InvalidAddress,

    /// Port outside `[1, 65535]`
    #[error("Invalid port passed, should be between 1 and 65535")]
    InvalidPort,

    /// Configured detection multiplier is zero
    #[error("Invalid detection multiplier supplied")]
    InvalidDetectionMultiplier,

    /// UpdatePeer may not change the peer address
    #[error("Unable to change peer address")]
    AddressNotChangeable,

    /// UpdatePeer may not change the multi-hop flag
    #[error("Unable to change multi hop")]
    MultihopNotChangeable,

    /// Operation is valid in principle but not supported by this revision
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Simple Password must be between 1 and 16 bytes
    #[error("Password needs to be between 1 and 16")]
    PasswordInvalidLength,

    /// Feature is recognised but not implemented
    #[error("Function not implemented: {0}")]
    NotImplemented(String),

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a `NotSupported` error with a custom message
    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Create a `NotImplemented` error with a custom message
    pub fn not_implemented<S: Into<String>>(msg: S) -> Self {
        Error::NotImplemented(msg.into())
    }
}
