//! Protocol enumerations shared across the BFD crates
//!
//! The numeric values follow RFC 5880 section 4.1 exactly; they appear on
//! the wire in the control packet header.

use std::fmt;

/// Session state carried in the 2-bit `Sta` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SessionState {
    AdminDown = 0,
    #[default]
    Down = 1,
    Init = 2,
    Up = 3,
}

impl SessionState {
    /// Decode a 2-bit wire value. Only the low two bits are significant.
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0 => SessionState::AdminDown,
            1 => SessionState::Down,
            2 => SessionState::Init,
            _ => SessionState::Up,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::AdminDown => "Admin Down",
            SessionState::Down => "Down",
            SessionState::Init => "Init",
            SessionState::Up => "Up",
        };
        write!(f, "{}", s)
    }
}

/// Diagnostic code carried in the 5-bit `Diag` field
///
/// Values 9-31 are reserved; a received reserved value is kept as-is so
/// it survives re-encoding intact and prints as `DiagnosticCode(n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DiagnosticCode {
    #[default]
    NoDiagnostic,
    ControlDetectionTimeExpired,
    EchoFunctionFailed,
    NeighborSignaledSessionDown,
    ForwardingPlaneReset,
    PathDown,
    ConcatenatedPathDown,
    AdministrativelyDown,
    ReverseConcatenatedPathDown,
    /// Reserved wire value in 9-31, preserved as received
    Reserved(u8),
}

impl DiagnosticCode {
    /// Decode a 5-bit wire value; reserved values are preserved verbatim
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => DiagnosticCode::NoDiagnostic,
            1 => DiagnosticCode::ControlDetectionTimeExpired,
            2 => DiagnosticCode::EchoFunctionFailed,
            3 => DiagnosticCode::NeighborSignaledSessionDown,
            4 => DiagnosticCode::ForwardingPlaneReset,
            5 => DiagnosticCode::PathDown,
            6 => DiagnosticCode::ConcatenatedPathDown,
            7 => DiagnosticCode::AdministrativelyDown,
            8 => DiagnosticCode::ReverseConcatenatedPathDown,
            other => DiagnosticCode::Reserved(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            DiagnosticCode::NoDiagnostic => 0,
            DiagnosticCode::ControlDetectionTimeExpired => 1,
            DiagnosticCode::EchoFunctionFailed => 2,
            DiagnosticCode::NeighborSignaledSessionDown => 3,
            DiagnosticCode::ForwardingPlaneReset => 4,
            DiagnosticCode::PathDown => 5,
            DiagnosticCode::ConcatenatedPathDown => 6,
            DiagnosticCode::AdministrativelyDown => 7,
            DiagnosticCode::ReverseConcatenatedPathDown => 8,
            DiagnosticCode::Reserved(value) => value,
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagnosticCode::NoDiagnostic => "No Diagnostic",
            DiagnosticCode::ControlDetectionTimeExpired => "Control Detection Time Expired",
            DiagnosticCode::EchoFunctionFailed => "Echo Function Failed",
            DiagnosticCode::NeighborSignaledSessionDown => "Neighbor Signaled Session Down",
            DiagnosticCode::ForwardingPlaneReset => "Forwardling Plane Reset",
            DiagnosticCode::PathDown => "Path Down",
            DiagnosticCode::ConcatenatedPathDown => "Concatenated Path Down",
            DiagnosticCode::AdministrativelyDown => "Administratively Down",
            DiagnosticCode::ReverseConcatenatedPathDown => "Reverse Concatenated Path Down",
            DiagnosticCode::Reserved(value) => {
                return write!(f, "DiagnosticCode({})", value);
            }
        };
        write!(f, "{}", s)
    }
}

/// Authentication type of the optional trailing section
///
/// The variant set is closed by RFC 5880 section 4.1; only Simple Password
/// is implemented in this revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AuthenticationType {
    #[default]
    Reserved = 0,
    SimplePassword = 1,
    KeyedMd5 = 2,
    MeticulousKeyedMd5 = 3,
    KeyedSha1 = 4,
    MeticulousKeyedSha1 = 5,
}

impl AuthenticationType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AuthenticationType::Reserved),
            1 => Some(AuthenticationType::SimplePassword),
            2 => Some(AuthenticationType::KeyedMd5),
            3 => Some(AuthenticationType::MeticulousKeyedMd5),
            4 => Some(AuthenticationType::KeyedSha1),
            5 => Some(AuthenticationType::MeticulousKeyedSha1),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for AuthenticationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthenticationType::Reserved => "Reserved",
            AuthenticationType::SimplePassword => "Simple Password",
            AuthenticationType::KeyedMd5 => "Keyed MD5",
            AuthenticationType::MeticulousKeyedMd5 => "Meticulous Keyed MD5",
            AuthenticationType::KeyedSha1 => "Keyed SHA1",
            AuthenticationType::MeticulousKeyedSha1 => "Meticulous Keyed SHA1",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::AdminDown.to_string(), "Admin Down");
        assert_eq!(SessionState::Down.to_string(), "Down");
        assert_eq!(SessionState::Init.to_string(), "Init");
        assert_eq!(SessionState::Up.to_string(), "Up");
    }

    #[test]
    fn test_session_state_wire_values() {
        for state in [
            SessionState::AdminDown,
            SessionState::Down,
            SessionState::Init,
            SessionState::Up,
        ] {
            assert_eq!(SessionState::from_u8(state.to_u8()), state);
        }
        // only the low two bits are read
        assert_eq!(SessionState::from_u8(0x07), SessionState::Up);
    }

    #[test]
    fn test_diagnostic_code_display() {
        assert_eq!(DiagnosticCode::NoDiagnostic.to_string(), "No Diagnostic");
        assert_eq!(
            DiagnosticCode::ControlDetectionTimeExpired.to_string(),
            "Control Detection Time Expired"
        );
        assert_eq!(
            DiagnosticCode::NeighborSignaledSessionDown.to_string(),
            "Neighbor Signaled Session Down"
        );
        assert_eq!(
            DiagnosticCode::ForwardingPlaneReset.to_string(),
            "Forwardling Plane Reset"
        );
        assert_eq!(
            DiagnosticCode::ReverseConcatenatedPathDown.to_string(),
            "Reverse Concatenated Path Down"
        );
        assert_eq!(DiagnosticCode::Reserved(9).to_string(), "DiagnosticCode(9)");
    }

    #[test]
    fn test_diagnostic_code_wire_values() {
        for value in 0..=31u8 {
            let code = DiagnosticCode::from_u8(value);
            assert_eq!(code.to_u8(), value);
        }
        assert_eq!(DiagnosticCode::from_u8(9), DiagnosticCode::Reserved(9));
        assert_eq!(DiagnosticCode::from_u8(31), DiagnosticCode::Reserved(31));
    }

    #[test]
    fn test_authentication_type_display() {
        assert_eq!(AuthenticationType::Reserved.to_string(), "Reserved");
        assert_eq!(
            AuthenticationType::SimplePassword.to_string(),
            "Simple Password"
        );
        assert_eq!(AuthenticationType::KeyedMd5.to_string(), "Keyed MD5");
        assert_eq!(
            AuthenticationType::MeticulousKeyedSha1.to_string(),
            "Meticulous Keyed SHA1"
        );
    }

    #[test]
    fn test_authentication_type_wire_values() {
        for value in 0..=5u8 {
            let auth = AuthenticationType::from_u8(value).unwrap();
            assert_eq!(auth.to_u8(), value);
        }
        assert_eq!(AuthenticationType::from_u8(6), None);
    }
}
