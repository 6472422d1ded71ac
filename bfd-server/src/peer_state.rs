//! Per-side session state snapshots
//!
//! A `PeerState` describes one side (local or remote) of a session's
//! negotiated parameters. Snapshots are immutable once published; mutation
//! is expressed by deriving a new snapshot from the old one through a list
//! of updates, applied in list order. Readers copy the current snapshot
//! out of the session lock and never observe a half-applied change.

use bfd_core::{DiagnosticCode, SessionState};

/// Immutable snapshot of one side of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerState {
    discriminator: u32,
    session_state: SessionState,
    diagnostic: DiagnosticCode,
    /// Microseconds
    desired_min_tx_interval: u32,
    /// Microseconds
    required_min_rx_interval: u32,
    detect_multiplier: u8,
    demand_mode: bool,
}

/// One element of the closed, finite update set
///
/// No update fails; validation lives at the admission boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStateUpdate {
    Discriminator(u32),
    State(SessionState),
    Diagnostic(DiagnosticCode),
    DesiredMinTxInterval(u32),
    RequiredMinRxInterval(u32),
    DetectMultiplier(u8),
    DemandMode(bool),
}

impl PeerState {
    /// Initial local snapshot for a freshly admitted session.
    ///
    /// The advertised transmit interval starts at one second regardless of
    /// the configured target (RFC 5880 section 6.8.3).
    pub(crate) fn initial_local(
        discriminator: u32,
        required_min_rx_interval: u32,
        detect_multiplier: u8,
    ) -> Self {
        Self {
            discriminator,
            session_state: SessionState::Down,
            diagnostic: DiagnosticCode::NoDiagnostic,
            desired_min_tx_interval: 1_000_000,
            required_min_rx_interval,
            detect_multiplier,
            demand_mode: false,
        }
    }

    /// Initial remote snapshot: nothing is known about the peer yet, the
    /// remote minimum receive interval starts at 1 (RFC 5880 section 6.8.1).
    pub(crate) fn initial_remote() -> Self {
        Self {
            session_state: SessionState::Down,
            required_min_rx_interval: 1,
            ..Default::default()
        }
    }

    /// Derive the next snapshot by applying `updates` in order to a copy
    pub fn with_updates(&self, updates: &[PeerStateUpdate]) -> Self {
        let mut next = *self;
        for update in updates {
            match *update {
                PeerStateUpdate::Discriminator(v) => next.discriminator = v,
                PeerStateUpdate::State(v) => next.session_state = v,
                PeerStateUpdate::Diagnostic(v) => next.diagnostic = v,
                PeerStateUpdate::DesiredMinTxInterval(v) => next.desired_min_tx_interval = v,
                PeerStateUpdate::RequiredMinRxInterval(v) => next.required_min_rx_interval = v,
                PeerStateUpdate::DetectMultiplier(v) => next.detect_multiplier = v,
                PeerStateUpdate::DemandMode(v) => next.demand_mode = v,
            }
        }
        next
    }

    pub fn discriminator(&self) -> u32 {
        self.discriminator
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn diagnostic(&self) -> DiagnosticCode {
        self.diagnostic
    }

    pub fn desired_min_tx_interval(&self) -> u32 {
        self.desired_min_tx_interval
    }

    pub fn required_min_rx_interval(&self) -> u32 {
        self.required_min_rx_interval
    }

    pub fn detect_multiplier(&self) -> u8 {
        self.detect_multiplier
    }

    pub fn demand_mode(&self) -> bool {
        self.demand_mode
    }
}
