//! Administrative surface over the session set
//!
//! The complete lifecycle surface of the daemon: add, update, delete,
//! enable, disable, list, query and monitor. Any external framing (RPC,
//! HTTP, UNIX socket) is a thin adapter over these calls; nothing here
//! touches the wire.

use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use bfd_core::{Error, Result};

use crate::server::{BfdServer, PeerSpec};
use crate::session::Session;
use crate::watcher::{StateChange, Watcher};

/// One row of the `ListPeer` result
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub uuid: Uuid,
    pub name: String,
    pub address: SocketAddr,
    /// Microseconds
    pub desired_min_tx_interval: u32,
    /// Microseconds
    pub required_min_rx_interval: u32,
    pub detect_multiplier: u8,
    pub is_multi_hop: bool,
}

/// Administrative request to change session parameters.
///
/// Absent fields leave the corresponding parameter unchanged. The peer
/// address and the multi-hop flag are immutable for the lifetime of a
/// session.
#[derive(Debug, Clone, Default)]
pub struct UpdatePeerSpec {
    pub address: Option<String>,
    /// Milliseconds
    pub desired_min_tx: Option<u32>,
    /// Milliseconds
    pub required_min_rx: Option<u32>,
    pub detect_multiplier: Option<u8>,
    pub is_multi_hop: Option<bool>,
}

/// The administrative interface
pub struct AdminApi {
    server: Arc<BfdServer>,
}

impl AdminApi {
    pub fn new(server: Arc<BfdServer>) -> Self {
        Self { server }
    }

    /// Create and start a session; returns its handle uuid
    pub async fn add_peer(&self, spec: &PeerSpec) -> Result<Uuid> {
        let session = self.server.add_peer(spec).await?;
        Ok(session.uuid())
    }

    /// Apply parameter changes to an existing session
    pub async fn update_peer(&self, uuid: Uuid, spec: &UpdatePeerSpec) -> Result<()> {
        let session = self.server.get_peer_by_uuid(uuid)?;

        if let Some(address) = &spec.address {
            if *address != session.address().to_string() {
                return Err(Error::AddressNotChangeable);
            }
        }

        if let Some(is_multi_hop) = spec.is_multi_hop {
            if is_multi_hop != session.is_multi_hop() {
                return Err(Error::MultihopNotChangeable);
            }
        }

        let local = session.local();

        if let Some(desired_ms) = spec.desired_min_tx {
            let desired = desired_ms.saturating_mul(1000);
            if desired != 0 && desired != local.desired_min_tx_interval() {
                session.set_desired_min_tx_interval(desired).await?;
            }
        }

        if let Some(required_ms) = spec.required_min_rx {
            let required = required_ms.saturating_mul(1000);
            if required != 0 && required != local.required_min_rx_interval() {
                session.set_required_min_rx_interval(required).await?;
            }
        }

        if let Some(multiplier) = spec.detect_multiplier {
            if multiplier != 0 && multiplier != local.detect_multiplier() {
                session.set_detect_multiplier(multiplier).await?;
            }
        }

        Ok(())
    }

    /// Remove a session; its watchers observe end-of-stream
    pub fn delete_peer(&self, uuid: Uuid) -> Result<()> {
        self.server.delete_peer(uuid)
    }

    /// Transition AdminDown -> Down
    pub async fn enable_peer(&self, uuid: Uuid) -> Result<()> {
        self.server.get_peer_by_uuid(uuid)?.enable().await
    }

    /// Transition into AdminDown
    pub async fn disable_peer(&self, uuid: Uuid) -> Result<()> {
        self.server.get_peer_by_uuid(uuid)?.disable().await
    }

    /// Enumerate all sessions
    pub fn list_peers(&self) -> Vec<PeerEntry> {
        self.server
            .list_peers()
            .into_iter()
            .map(|session| peer_entry(&session))
            .collect()
    }

    /// Local and remote snapshots of one session
    pub fn get_peer_state(&self, uuid: Uuid) -> Result<StateChange> {
        let session = self.server.get_peer_by_uuid(uuid)?;
        Ok(StateChange {
            local: session.local(),
            remote: session.remote(),
        })
    }

    /// Stream state transitions until the watcher is stopped or the
    /// session is deleted
    pub fn monitor_peer(&self, uuid: Uuid) -> Result<Watcher> {
        self.server.monitor_peer(uuid)
    }
}

fn peer_entry(session: &Session) -> PeerEntry {
    let local = session.local();

    PeerEntry {
        uuid: session.uuid(),
        name: session.name(),
        address: session.address(),
        desired_min_tx_interval: local.desired_min_tx_interval(),
        required_min_rx_interval: local.required_min_rx_interval(),
        detect_multiplier: local.detect_multiplier(),
        is_multi_hop: session.is_multi_hop(),
    }
}
