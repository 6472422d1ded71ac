//! Optional authentication section of the control packet
//!
//! The section layout is `authType(1) | authLen(1) | ...`; the variant set
//! is closed (RFC 5880 section 4.1). Only Simple Password is implemented,
//! the keyed MD5/SHA1 variants are rejected at parse time.

use bytes::{BufMut, BytesMut};

use bfd_core::{AuthenticationType, Error, Result};

/// Shortest possible Simple Password section: type, length, key id, 1 byte
const SIMPLE_PASSWORD_MIN_SIZE: usize = 4;

/// Authentication section variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationSection {
    SimplePassword(SimplePassword),
}

/// Simple Password authentication data (RFC 5880 section 4.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimplePassword {
    pub key_id: u8,
    /// Between 1 and 16 bytes
    pub password: String,
}

impl AuthenticationSection {
    /// The wire authentication type of this section
    pub fn auth_type(&self) -> AuthenticationType {
        match self {
            AuthenticationSection::SimplePassword(_) => AuthenticationType::SimplePassword,
        }
    }

    /// Validate the section against a configured key.
    ///
    /// The `packet` argument carries the encoded control packet for the
    /// keyed digest variants; Simple Password ignores it.
    pub fn is_valid(&self, key: &[u8], _packet: &[u8]) -> bool {
        match self {
            AuthenticationSection::SimplePassword(pw) => pw.password.as_bytes() == key,
        }
    }

    /// Append the encoded section to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            AuthenticationSection::SimplePassword(pw) => {
                if pw.password.is_empty() || pw.password.len() > 16 {
                    return Err(Error::PasswordInvalidLength);
                }

                buf.put_u8(AuthenticationType::SimplePassword.to_u8());
                buf.put_u8((3 + pw.password.len()) as u8);
                buf.put_u8(pw.key_id);
                buf.put_slice(pw.password.as_bytes());
                Ok(())
            }
        }
    }

    /// Parse an authentication section from the trailing bytes of a packet.
    ///
    /// The length field must cover the whole slice.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SIMPLE_PASSWORD_MIN_SIZE {
            return Err(Error::InvalidPacketLength);
        }

        match AuthenticationType::from_u8(buf[0]) {
            Some(AuthenticationType::SimplePassword) => {
                if buf[1] as usize != buf.len() {
                    return Err(Error::InvalidPacketLength);
                }

                Ok(AuthenticationSection::SimplePassword(SimplePassword {
                    key_id: buf[2],
                    password: String::from_utf8_lossy(&buf[3..]).into_owned(),
                }))
            }
            _ => Err(Error::InvalidAuthenticationType),
        }
    }
}

impl From<SimplePassword> for AuthenticationSection {
    fn from(pw: SimplePassword) -> Self {
        AuthenticationSection::SimplePassword(pw)
    }
}
