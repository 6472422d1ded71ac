//! BFD server: session registry, listening sockets and packet dispatch
//!
//! The server owns the discriminator-indexed session table, one receive
//! task per listening socket and a single dispatch task that drains the
//! bounded inbound queue. Inbound datagrams pass the TTL gate, the codec
//! and the RFC 5880 section 6.8.6 admission checks before they reach a
//! session's state machine.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bfd_core::{Error, Result, SessionState};
use bfd_packet::{ControlPacket, BFD_CONTROL_PORT, MAXIMUM_SIZE};

use crate::session::{Session, SessionParams, OFFLINE_TIMEOUT};
use crate::ttl::RecvSocket;
use crate::watcher::Watcher;

/// Inbound queue depth; the receive workers block briefly on overflow
const INBOUND_QUEUE_DEPTH: usize = 5;

/// Administrative request to add a peer.
///
/// Intervals are in milliseconds; the admission path converts them to the
/// microseconds used internally and on the wire.
#[derive(Debug, Clone)]
pub struct PeerSpec {
    pub name: String,
    /// `address[:port]`; the port defaults to 3784
    pub address: String,
    /// Milliseconds
    pub desired_min_tx: u32,
    /// Milliseconds
    pub required_min_rx: u32,
    pub detect_multiplier: u8,
    pub is_multi_hop: bool,
}

struct InboundPacket {
    addr: SocketAddr,
    packet: ControlPacket,
}

/// The BFD server
pub struct BfdServer {
    sessions: DashMap<u32, Arc<Session>>,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
    inbound_tx: mpsc::Sender<InboundPacket>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundPacket>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl BfdServer {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            sessions: DashMap::new(),
            listeners: Mutex::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown_tx,
        }
    }

    /// Validate, create, register and start a session for the peer
    pub async fn add_peer(&self, spec: &PeerSpec) -> Result<Arc<Session>> {
        if spec.detect_multiplier == 0 {
            return Err(Error::InvalidDetectionMultiplier);
        }

        let (ip, port) = parse_peer_address(&spec.address)?;

        let (discriminator, source_port) = {
            let mut rng = rand::thread_rng();

            // nonzero and unique within this server instance
            let discriminator = loop {
                let candidate = rng.gen_range(1..=u32::MAX);
                if !self.sessions.contains_key(&candidate) {
                    break candidate;
                }
            };

            let source_port: u16 = rng.gen_range(49152..=65535);
            (discriminator, source_port)
        };

        let session = Session::connect(SessionParams {
            name: spec.name.clone(),
            address: SocketAddr::new(ip, port),
            source_port,
            discriminator,
            // admin supplies milliseconds, the session runs on microseconds
            interval: spec.desired_min_tx.saturating_mul(1000),
            required_min_rx_interval: spec.required_min_rx.saturating_mul(1000),
            detect_multiplier: spec.detect_multiplier,
            is_multi_hop: spec.is_multi_hop,
        })
        .await?;

        let session = Arc::new(session);

        session.schedule_expiry(u64::from(OFFLINE_TIMEOUT));
        session.schedule_send(u64::from(session.local().desired_min_tx_interval()));

        self.sessions.insert(discriminator, Arc::clone(&session));
        session.start();

        info!(
            id = %session.uuid(),
            peer = %session.address(),
            name = %spec.name,
            "peer added"
        );

        Ok(session)
    }

    /// Look up a session by its uuid (linear scan)
    pub fn get_peer_by_uuid(&self, uuid: Uuid) -> Result<Arc<Session>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().uuid() == uuid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::PeerNotFound)
    }

    /// Snapshot of all registered sessions
    pub fn list_peers(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Stream state transitions of one session until the watcher is
    /// stopped, dropped, or the session is deleted
    pub fn monitor_peer(&self, uuid: Uuid) -> Result<Watcher> {
        let session = self.get_peer_by_uuid(uuid)?;
        Ok(session.watch())
    }

    /// Remove a session from the registry and shut it down
    pub fn delete_peer(&self, uuid: Uuid) -> Result<()> {
        let session = self.get_peer_by_uuid(uuid)?;

        self.sessions.remove(&session.local().discriminator());
        session.shutdown();

        info!(id = %uuid, peer = %session.address(), "peer deleted");

        Ok(())
    }

    /// Bind a listening socket and spawn its receive worker
    pub fn listen(&self, address: &str) -> Result<()> {
        let addr = parse_listen_address(address)?;
        let socket = RecvSocket::bind(addr)?;

        info!(listen = %addr, "listening");

        let task = tokio::spawn(receive_loop(
            socket,
            self.inbound_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));

        self.listeners.lock().insert(address.to_string(), task);

        Ok(())
    }

    /// Start the dispatcher; binds the default listening socket when none
    /// was configured
    pub fn serve(self: &Arc<Self>) -> Result<()> {
        if let Some(rx) = self.inbound_rx.lock().take() {
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(dispatch_loop(Arc::clone(self), rx, shutdown));
        }

        if self.listeners.lock().is_empty() {
            self.listen(&format!("0.0.0.0:{}", BFD_CONTROL_PORT))?;
        }

        Ok(())
    }

    /// Stop every worker and every session
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        for entry in self.sessions.iter() {
            entry.value().shutdown();
        }

        info!("server shutdown");
    }

    /// Route one queued packet to its session
    async fn dispatch(&self, inbound: InboundPacket) -> Result<()> {
        let packet = &inbound.packet;

        check_packet(packet)?;

        // A nonzero Your Discriminator selects the session directly; zero
        // falls back to the source address of the datagram.
        let session = if packet.your_discriminator != 0 {
            self.sessions
                .get(&packet.your_discriminator)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or(Error::YourDiscriminatorNotFound(packet.your_discriminator))?
        } else {
            self.find_peer_by_ip(inbound.addr.ip())
                .ok_or(Error::PeerNotFound)?
        };

        session.handle_packet(packet).await
    }

    fn find_peer_by_ip(&self, ip: IpAddr) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|entry| entry.value().address().ip() == ip)
            .map(|entry| Arc::clone(entry.value()))
    }

    #[cfg(test)]
    async fn inject(&self, addr: SocketAddr, packet: ControlPacket) -> Result<()> {
        self.dispatch(InboundPacket { addr, packet }).await
    }
}

impl Default for BfdServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission checks applied to every packet before dispatch (RFC 5880
/// section 6.8.6)
fn check_packet(packet: &ControlPacket) -> Result<()> {
    if packet.version != 1 {
        return Err(Error::InvalidVersion);
    }

    if packet.detect_multiplier == 0 {
        return Err(Error::InvalidDetectMultiplier);
    }

    if packet.multipoint {
        return Err(Error::InvalidMultiPoint);
    }

    if packet.my_discriminator == 0 {
        return Err(Error::InvalidMyDiscriminator);
    }

    if packet.your_discriminator == 0
        && !matches!(
            packet.state,
            SessionState::Down | SessionState::AdminDown
        )
    {
        return Err(Error::InvalidYourDiscriminator);
    }

    Ok(())
}

/// Parse `address[:port]` for a peer; the port defaults to 3784
fn parse_peer_address(address: &str) -> Result<(IpAddr, u16)> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok((ip, BFD_CONTROL_PORT));
    }

    if let Some((host, port)) = address.rsplit_once(':') {
        let port: u16 = port.parse().map_err(|_| Error::InvalidPort)?;
        if port == 0 {
            return Err(Error::InvalidPort);
        }

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip = host.parse().map_err(|_| Error::InvalidAddress)?;
        return Ok((ip, port));
    }

    Err(Error::InvalidAddress)
}

/// Parse `host[:port]` for a listening socket; the port defaults to 3784
fn parse_listen_address(address: &str) -> Result<SocketAddr> {
    let (ip, port) = parse_peer_address(address)?;
    Ok(SocketAddr::new(ip, port))
}

/// Receive worker: one datagram per iteration, TTL gate, decode, enqueue
async fn receive_loop(
    socket: RecvSocket,
    inbound_tx: mpsc::Sender<InboundPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; MAXIMUM_SIZE * 2];

    loop {
        tokio::select! {
            result = socket.recv_with_ttl(&mut buf) => match result {
                Ok((len, ttl, addr)) => {
                    if let Err(e) = accept_datagram(&buf[..len], ttl, addr, &inbound_tx).await {
                        debug!(peer = %addr, error = %e, "datagram discarded");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "receive failed");
                }
            },
            _ = shutdown.changed() => {
                debug!("receive worker stopped");
                return;
            }
        }
    }
}

/// Check the received TTL, decode the datagram and queue it for dispatch
async fn accept_datagram(
    payload: &[u8],
    ttl: Option<u8>,
    addr: SocketAddr,
    inbound_tx: &mpsc::Sender<InboundPacket>,
) -> Result<()> {
    // RFC 5881 section 5: anything below 255 has crossed a router
    match ttl {
        Some(255) => {}
        Some(other) => return Err(Error::InvalidTtl(other)),
        None => return Err(Error::InvalidTtl(0)),
    }

    let packet = ControlPacket::decode(payload)?;

    let _ = inbound_tx.send(InboundPacket { addr, packet }).await;

    Ok(())
}

/// Dispatch worker: drains the inbound queue in arrival order
async fn dispatch_loop(
    server: Arc<BfdServer>,
    mut inbound_rx: mpsc::Receiver<InboundPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            inbound = inbound_rx.recv() => match inbound {
                Some(inbound) => {
                    let peer = inbound.addr;
                    if let Err(e) = server.dispatch(inbound).await {
                        debug!(peer = %peer, error = %e, "packet discarded");
                    }
                }
                None => return,
            },
            _ = shutdown.changed() => {
                debug!("dispatcher stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spec(address: &str) -> PeerSpec {
        PeerSpec {
            name: "test-peer".to_string(),
            address: address.to_string(),
            desired_min_tx: 100,
            required_min_rx: 100,
            detect_multiplier: 1,
            is_multi_hop: false,
        }
    }

    fn valid_packet() -> ControlPacket {
        ControlPacket {
            version: 1,
            detect_multiplier: 3,
            my_discriminator: 60,
            your_discriminator: 0,
            state: SessionState::Down,
            ..Default::default()
        }
    }

    fn source() -> SocketAddr {
        "127.0.0.1:15662".parse().unwrap()
    }

    #[tokio::test]
    async fn test_add_peer_invalid_detect_multiplier() {
        let server = BfdServer::new();
        let result = server
            .add_peer(&PeerSpec {
                detect_multiplier: 0,
                ..spec("127.0.0.1")
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidDetectionMultiplier)));
    }

    #[tokio::test]
    async fn test_add_peer_invalid_address() {
        let server = BfdServer::new();
        let result = server.add_peer(&spec("300.300.300.300")).await;
        assert!(matches!(result, Err(Error::InvalidAddress)));
    }

    #[tokio::test]
    async fn test_add_peer_invalid_port_string() {
        let server = BfdServer::new();
        let result = server.add_peer(&spec("127.0.0.1:asdf")).await;
        assert!(matches!(result, Err(Error::InvalidPort)));
    }

    #[tokio::test]
    async fn test_add_peer_invalid_port_numeric() {
        let server = BfdServer::new();
        let result = server.add_peer(&spec("127.0.0.1:80000")).await;
        assert!(matches!(result, Err(Error::InvalidPort)));
    }

    #[tokio::test]
    async fn test_add_peer_with_port() {
        let server = BfdServer::new();
        let session = server.add_peer(&spec("127.0.0.1:4000")).await.unwrap();
        assert_eq!(session.address().to_string(), "127.0.0.1:4000");
        server.shutdown();
    }

    #[tokio::test]
    async fn test_add_peer_default_port() {
        let server = BfdServer::new();
        let session = server.add_peer(&spec("127.0.0.1")).await.unwrap();
        assert_eq!(session.address().port(), BFD_CONTROL_PORT);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_add_peer_converts_milliseconds() {
        let server = BfdServer::new();
        let session = server.add_peer(&spec("127.0.0.1")).await.unwrap();

        let local = session.local();
        assert_eq!(local.required_min_rx_interval(), 100_000);
        // the advertised transmit interval starts slow regardless of target
        assert_eq!(local.desired_min_tx_interval(), 1_000_000);
        assert_ne!(local.discriminator(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_get_peer_by_uuid() {
        let server = BfdServer::new();
        let session = server.add_peer(&spec("127.0.0.1")).await.unwrap();

        let found = server.get_peer_by_uuid(session.uuid()).unwrap();
        assert_eq!(found.uuid(), session.uuid());

        let missing = server.get_peer_by_uuid(Uuid::now_v7());
        assert!(matches!(missing, Err(Error::PeerNotFound)));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_list_peers() {
        let server = BfdServer::new();
        server.add_peer(&spec("127.0.0.1")).await.unwrap();
        server.add_peer(&spec("127.0.0.2")).await.unwrap();

        let peers = server.list_peers();
        assert_eq!(peers.len(), 2);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_delete_peer() {
        let server = BfdServer::new();
        let session = server.add_peer(&spec("127.0.0.1")).await.unwrap();
        let uuid = session.uuid();
        drop(session);

        server.delete_peer(uuid).unwrap();
        assert!(matches!(
            server.delete_peer(uuid),
            Err(Error::PeerNotFound)
        ));
        assert!(server.list_peers().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_peer_unknown_uuid() {
        let server = BfdServer::new();
        assert!(matches!(
            server.monitor_peer(Uuid::now_v7()),
            Err(Error::PeerNotFound)
        ));
    }

    #[tokio::test]
    async fn test_monitor_peer_sees_transitions() {
        let server = BfdServer::new();
        let session = server.add_peer(&spec("127.0.0.1")).await.unwrap();
        let mut watcher = server.monitor_peer(session.uuid()).unwrap();

        session
            .apply_local(vec![crate::peer_state::PeerStateUpdate::State(
                SessionState::Up,
            )])
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), watcher.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.local.session_state(), SessionState::Up);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_monitor_ends_after_delete() {
        let server = BfdServer::new();
        let uuid = {
            let session = server.add_peer(&spec("127.0.0.1")).await.unwrap();
            session.uuid()
        };

        let mut watcher = server.monitor_peer(uuid).unwrap();
        server.delete_peer(uuid).unwrap();

        // once the session's tasks wind down the stream ends cleanly
        let end = timeout(Duration::from_secs(5), watcher.recv()).await;
        assert_eq!(end.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dispatch_invalid_version() {
        let server = BfdServer::new();
        let result = server
            .inject(
                source(),
                ControlPacket {
                    version: 2,
                    ..valid_packet()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidVersion)));
    }

    #[tokio::test]
    async fn test_dispatch_zero_detect_multiplier() {
        let server = BfdServer::new();
        let result = server
            .inject(
                source(),
                ControlPacket {
                    detect_multiplier: 0,
                    ..valid_packet()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidDetectMultiplier)));
    }

    #[tokio::test]
    async fn test_dispatch_multipoint() {
        let server = BfdServer::new();
        let result = server
            .inject(
                source(),
                ControlPacket {
                    multipoint: true,
                    ..valid_packet()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidMultiPoint)));
    }

    #[tokio::test]
    async fn test_dispatch_zero_my_discriminator() {
        let server = BfdServer::new();
        let result = server
            .inject(
                source(),
                ControlPacket {
                    my_discriminator: 0,
                    ..valid_packet()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidMyDiscriminator)));
    }

    #[tokio::test]
    async fn test_dispatch_zero_your_discriminator_wrong_state() {
        let server = BfdServer::new();
        let result = server
            .inject(
                source(),
                ControlPacket {
                    my_discriminator: 2343,
                    your_discriminator: 0,
                    state: SessionState::Up,
                    ..valid_packet()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidYourDiscriminator)));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_your_discriminator() {
        let server = BfdServer::new();
        let result = server
            .inject(
                source(),
                ControlPacket {
                    your_discriminator: 55,
                    state: SessionState::Up,
                    ..valid_packet()
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::YourDiscriminatorNotFound(55))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_no_session_for_source_ip() {
        let server = BfdServer::new();
        let result = server.inject(source(), valid_packet()).await;
        assert!(matches!(result, Err(Error::PeerNotFound)));
    }

    #[tokio::test]
    async fn test_dispatch_matches_session_by_source_ip() {
        let server = BfdServer::new();
        server.add_peer(&spec("127.0.0.1")).await.unwrap();

        server.inject(source(), valid_packet()).await.unwrap();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_dispatch_matches_session_by_discriminator() {
        let server = BfdServer::new();
        let session = server.add_peer(&spec("127.0.0.1")).await.unwrap();

        let packet = ControlPacket {
            your_discriminator: session.local().discriminator(),
            ..valid_packet()
        };
        server.inject(source(), packet).await.unwrap();

        // Down + Down advances the state machine
        assert_eq!(session.local().session_state(), SessionState::Init);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_accept_datagram_ttl_gate() {
        let (tx, _rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let payload = valid_packet().encode().unwrap();

        let result = accept_datagram(&payload, Some(254), source(), &tx).await;
        assert!(matches!(result, Err(Error::InvalidTtl(254))));

        let result = accept_datagram(&payload, None, source(), &tx).await;
        assert!(matches!(result, Err(Error::InvalidTtl(0))));
    }

    #[tokio::test]
    async fn test_accept_datagram_decode_failure() {
        let (tx, _rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let result = accept_datagram(&[0xFF, 0xFF], Some(255), source(), &tx).await;
        assert!(matches!(result, Err(Error::InvalidPacketLength)));
    }

    #[tokio::test]
    async fn test_accept_datagram_enqueues() {
        let (tx, mut rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let payload = valid_packet().encode().unwrap();

        accept_datagram(&payload, Some(255), source(), &tx)
            .await
            .unwrap();

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.addr, source());
        assert_eq!(inbound.packet.my_discriminator, 60);
    }

    #[test]
    fn test_parse_listen_address() {
        assert_eq!(
            parse_listen_address("127.0.0.1").unwrap(),
            "127.0.0.1:3784".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_address("10.0.0.1:4784").unwrap(),
            "10.0.0.1:4784".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            parse_listen_address("127.0.0.1:adf"),
            Err(Error::InvalidPort)
        ));
        assert!(matches!(
            parse_listen_address("888.888.888.888:3784"),
            Err(Error::InvalidAddress)
        ));
    }

    #[test]
    fn test_parse_peer_address_ipv6() {
        let (ip, port) = parse_peer_address("2ac9::22").unwrap();
        assert!(ip.is_ipv6());
        assert_eq!(port, BFD_CONTROL_PORT);

        let (ip, port) = parse_peer_address("[2ac9::22]:4000").unwrap();
        assert!(ip.is_ipv6());
        assert_eq!(port, 4000);
    }
}
