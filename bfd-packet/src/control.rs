//! BFD Control packet structure and codec
//!
//! Wire layout (big-endian, RFC 5880 section 4.1):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Vers |  Diag   |Sta|P|F|C|A|D|M|  Detect Mult  |    Length     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       My Discriminator                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Your Discriminator                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Desired Min TX Interval                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Required Min RX Interval                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Required Min Echo RX Interval                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! followed by an optional authentication section when the A bit is set.

use bytes::{BufMut, BytesMut};

use bfd_core::{AuthenticationType, DiagnosticCode, Error, Result, SessionState};

use crate::auth::AuthenticationSection;

/// BFD control packets travel over UDP destination port 3784 (RFC 5881)
pub const BFD_CONTROL_PORT: u16 = 3784;

/// Mandatory header size in bytes
pub const MINIMUM_SIZE: usize = 24;

/// Header plus the largest defined authentication section
pub const MAXIMUM_SIZE: usize = MINIMUM_SIZE + 28;

/// A decoded BFD control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub version: u8,
    pub diagnostic: DiagnosticCode,
    pub state: SessionState,
    pub poll: bool,
    pub final_bit: bool,
    pub control_plane_independent: bool,
    pub demand: bool,
    pub multipoint: bool,
    pub detect_multiplier: u8,
    pub my_discriminator: u32,
    pub your_discriminator: u32,
    /// Microseconds
    pub desired_min_tx_interval: u32,
    /// Microseconds
    pub required_min_rx_interval: u32,
    /// Microseconds
    pub required_min_echo_rx_interval: u32,
    /// Present iff the A bit is set on the wire
    pub auth: Option<AuthenticationSection>,
}

impl Default for ControlPacket {
    fn default() -> Self {
        Self {
            version: 1,
            diagnostic: DiagnosticCode::NoDiagnostic,
            state: SessionState::Down,
            poll: false,
            final_bit: false,
            control_plane_independent: false,
            demand: false,
            multipoint: false,
            detect_multiplier: 1,
            my_discriminator: 0,
            your_discriminator: 0,
            desired_min_tx_interval: 1_000_000,
            required_min_rx_interval: 1_000_000,
            required_min_echo_rx_interval: 0,
            auth: None,
        }
    }
}

impl ControlPacket {
    /// Create a version-1 packet with the given discriminators
    pub fn new(my_discriminator: u32, your_discriminator: u32) -> Self {
        Self {
            my_discriminator,
            your_discriminator,
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = state;
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: DiagnosticCode) -> Self {
        self.diagnostic = diagnostic;
        self
    }

    pub fn with_intervals(mut self, tx: u32, rx: u32) -> Self {
        self.desired_min_tx_interval = tx;
        self.required_min_rx_interval = rx;
        self
    }

    pub fn with_auth(mut self, auth: AuthenticationSection) -> Self {
        self.auth = Some(auth);
        self
    }

    /// The authentication type advertised by this packet; `Reserved` means
    /// the A bit is clear.
    pub fn auth_type(&self) -> AuthenticationType {
        match &self.auth {
            Some(section) => section.auth_type(),
            None => AuthenticationType::Reserved,
        }
    }

    /// Serialize into exactly `length` bytes.
    ///
    /// The A flag is set iff an authentication section is attached; the
    /// length byte is written last, once the total size is known.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(MAXIMUM_SIZE);

        buf.put_u8(self.version << 5 | self.diagnostic.to_u8());

        let mut flags = self.state.to_u8() << 6;
        if self.poll {
            flags |= 0x20;
        }
        if self.final_bit {
            flags |= 0x10;
        }
        if self.control_plane_independent {
            flags |= 0x08;
        }
        if self.auth.is_some() {
            flags |= 0x04;
        }
        if self.demand {
            flags |= 0x02;
        }
        if self.multipoint {
            flags |= 0x01;
        }
        buf.put_u8(flags);

        buf.put_u8(self.detect_multiplier);
        buf.put_u8(0); // length, patched below
        buf.put_u32(self.my_discriminator);
        buf.put_u32(self.your_discriminator);
        buf.put_u32(self.desired_min_tx_interval);
        buf.put_u32(self.required_min_rx_interval);
        buf.put_u32(self.required_min_echo_rx_interval);

        if let Some(auth) = &self.auth {
            auth.encode(&mut buf)?;
        }

        let len = buf.len();
        buf[3] = len as u8;

        Ok(buf.to_vec())
    }

    /// Parse a control packet from a received datagram.
    ///
    /// The input must be at least 24 bytes and its total size must equal
    /// the length field; both violations yield `InvalidPacketLength`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MINIMUM_SIZE {
            return Err(Error::InvalidPacketLength);
        }

        if buf[3] as usize != buf.len() {
            return Err(Error::InvalidPacketLength);
        }

        let auth = if (buf[1] >> 2) & 1 == 1 {
            Some(AuthenticationSection::decode(&buf[MINIMUM_SIZE..])?)
        } else {
            None
        };

        Ok(Self {
            version: (buf[0] & 0xE0) >> 5,
            diagnostic: DiagnosticCode::from_u8(buf[0] & 0x1F),
            state: SessionState::from_u8((buf[1] & 0xC0) >> 6),
            poll: (buf[1] >> 5) & 1 == 1,
            final_bit: (buf[1] >> 4) & 1 == 1,
            control_plane_independent: (buf[1] >> 3) & 1 == 1,
            demand: (buf[1] >> 1) & 1 == 1,
            multipoint: buf[1] & 1 == 1,
            detect_multiplier: buf[2],
            my_discriminator: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            your_discriminator: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            desired_min_tx_interval: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            required_min_rx_interval: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
            required_min_echo_rx_interval: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
            auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SimplePassword;

    fn golden_packet() -> ControlPacket {
        ControlPacket {
            version: 1,
            diagnostic: DiagnosticCode::NoDiagnostic,
            state: SessionState::Init,
            poll: true,
            final_bit: false,
            control_plane_independent: false,
            demand: true,
            multipoint: false,
            detect_multiplier: 0,
            my_discriminator: 5_231_466,
            your_discriminator: 6_934_612,
            desired_min_tx_interval: 1_000_000,
            required_min_rx_interval: 2_000_000,
            required_min_echo_rx_interval: 23_052,
            auth: None,
        }
    }

    const GOLDEN_BYTES: [u8; 24] = [
        0x20, 0xA2, 0x00, 0x18, //
        0x00, 0x4F, 0xD3, 0x6A, //
        0x00, 0x69, 0xD0, 0x54, //
        0x00, 0x0F, 0x42, 0x40, //
        0x00, 0x1E, 0x84, 0x80, //
        0x00, 0x00, 0x5A, 0x0C,
    ];

    #[test]
    fn test_encode_golden_vector() {
        let bytes = golden_packet().encode().unwrap();
        assert_eq!(bytes, GOLDEN_BYTES);
    }

    #[test]
    fn test_decode_golden_vector() {
        let parsed = ControlPacket::decode(&GOLDEN_BYTES).unwrap();
        assert_eq!(parsed, golden_packet());
        assert_eq!(parsed.auth_type(), AuthenticationType::Reserved);
    }

    #[test]
    fn test_roundtrip_with_simple_password() {
        let packet = golden_packet().with_auth(
            SimplePassword {
                key_id: 5,
                password: "HelloWorld".to_string(),
            }
            .into(),
        );

        let bytes = packet.encode().unwrap();

        // header + authType + authLen + keyId + 10 password bytes
        assert_eq!(bytes.len(), 37);
        assert_eq!(bytes[1] & 0x04, 0x04); // A bit
        assert_eq!(bytes[3], 37); // total length
        assert_eq!(bytes[24], 1); // Simple Password
        assert_eq!(bytes[25], 13); // section length
        assert_eq!(bytes[26], 5); // key id
        assert_eq!(&bytes[27..], b"HelloWorld");

        let parsed = ControlPacket::decode(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.auth_type(), AuthenticationType::SimplePassword);

        // re-encode reproduces the input bytes
        assert_eq!(parsed.encode().unwrap(), bytes);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            ControlPacket::decode(&GOLDEN_BYTES[..12]),
            Err(Error::InvalidPacketLength)
        ));
    }

    #[test]
    fn test_decode_length_field_mismatch() {
        // claims 37 bytes in the length field but carries only 28
        let mut bytes = GOLDEN_BYTES.to_vec();
        bytes[3] = 37;
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            ControlPacket::decode(&bytes),
            Err(Error::InvalidPacketLength)
        ));
    }

    #[test]
    fn test_decode_invalid_auth_type() {
        let mut bytes = GOLDEN_BYTES.to_vec();
        bytes[1] |= 0x04;
        bytes.extend_from_slice(&[9, 13, 5]);
        bytes.extend_from_slice(b"HelloWorld");
        bytes[3] = bytes.len() as u8;
        assert!(matches!(
            ControlPacket::decode(&bytes),
            Err(Error::InvalidAuthenticationType)
        ));
    }

    #[test]
    fn test_decode_auth_section_length_mismatch() {
        // section length field disagrees with the remaining bytes
        let mut bytes = GOLDEN_BYTES.to_vec();
        bytes[1] |= 0x04;
        bytes.extend_from_slice(&[1, 12, 5]);
        bytes.extend_from_slice(b"HelloWorld");
        bytes[3] = bytes.len() as u8;
        assert!(matches!(
            ControlPacket::decode(&bytes),
            Err(Error::InvalidPacketLength)
        ));
    }

    #[test]
    fn test_roundtrip_all_flags() {
        let packet = ControlPacket {
            version: 1,
            diagnostic: DiagnosticCode::PathDown,
            state: SessionState::Up,
            poll: true,
            final_bit: true,
            control_plane_independent: true,
            demand: true,
            multipoint: true,
            detect_multiplier: 255,
            my_discriminator: u32::MAX,
            your_discriminator: 1,
            desired_min_tx_interval: u32::MAX,
            required_min_rx_interval: 1,
            required_min_echo_rx_interval: 0,
            auth: None,
        };

        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), MINIMUM_SIZE);
        assert_eq!(ControlPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_roundtrip_all_states_and_diagnostics() {
        for state in [
            SessionState::AdminDown,
            SessionState::Down,
            SessionState::Init,
            SessionState::Up,
        ] {
            for diag in 0..=8u8 {
                let packet = ControlPacket::new(77, 88)
                    .with_state(state)
                    .with_diagnostic(DiagnosticCode::from_u8(diag));
                let bytes = packet.encode().unwrap();
                let parsed = ControlPacket::decode(&bytes).unwrap();
                assert_eq!(parsed, packet);
                assert_eq!(parsed.encode().unwrap(), bytes);
            }
        }
    }

    #[test]
    fn test_reserved_diagnostic_preserved() {
        // reserved diagnostics (9-31) pass through decode and re-encode
        // unchanged
        for diag in 9..=31u8 {
            let mut bytes = GOLDEN_BYTES.to_vec();
            bytes[0] = (bytes[0] & 0xE0) | diag;

            let parsed = ControlPacket::decode(&bytes).unwrap();
            assert_eq!(parsed.diagnostic, DiagnosticCode::Reserved(diag));
            assert_eq!(parsed.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn test_builder_defaults() {
        let packet = ControlPacket::new(42, 0);
        assert_eq!(packet.version, 1);
        assert_eq!(packet.state, SessionState::Down);
        assert_eq!(packet.my_discriminator, 42);
        assert_eq!(packet.your_discriminator, 0);
        assert!(packet.auth.is_none());
    }
}
