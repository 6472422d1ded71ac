//! One BFD session
//!
//! A session owns its connected transmit socket, its transmit and expiry
//! timers, the local and remote [`PeerState`] snapshots, a management
//! mailbox and its watcher list. Two cooperative tasks run per session:
//!
//! - the **mailbox loop** executes management operations one at a time,
//!   serializing every mutation of the snapshots, the poll flag and the
//!   watcher list;
//! - the **timing loop** multiplexes the transmit timer, the detection
//!   expiry timer and the shutdown signal.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use bfd_core::{AuthenticationType, DiagnosticCode, Error, Result, SessionState};
use bfd_packet::ControlPacket;

use crate::peer_state::{PeerState, PeerStateUpdate};
use crate::watcher::{self, StateChange, Watcher, WatcherHandle};

/// Expiry timeout while a session is not Up: 20 seconds in microseconds
pub const OFFLINE_TIMEOUT: u32 = 20_000_000;

/// Advertised transmit interval below Up (RFC 5880 section 6.8.3)
const SLOW_TX_INTERVAL: u32 = 1_000_000;

/// Management mailbox depth
const MAILBOX_DEPTH: usize = 8;

/// Stand-in deadline for a disarmed timer
const FAR_FUTURE: Duration = Duration::from_secs(5 * 3600);

/// Parameters for establishing a session, validated by the server admission
/// path (admin inputs are milliseconds; everything here is microseconds)
pub(crate) struct SessionParams {
    pub name: String,
    pub address: SocketAddr,
    pub source_port: u16,
    pub discriminator: u32,
    /// Target desired-min-tx once the session reaches Up, microseconds
    pub interval: u32,
    /// Microseconds
    pub required_min_rx_interval: u32,
    pub detect_multiplier: u8,
    pub is_multi_hop: bool,
}

/// State guarded by the session lock; only mailbox operations mutate it
struct SharedState {
    name: String,
    local: PeerState,
    remote: PeerState,
    auth_type: AuthenticationType,
    poll_active: bool,
    watchers: Vec<WatcherHandle>,
}

struct MgmtOp {
    f: Box<dyn FnOnce(&Session) -> Result<()> + Send>,
    reply: oneshot::Sender<Result<()>>,
}

enum TimerCmd {
    /// Arm the transmit timer, microseconds from now
    Transmit(u64),
    /// Arm the expiry timer, microseconds from now
    Expiry(u64),
}

/// One BFD session
pub struct Session {
    uuid: Uuid,
    address: SocketAddr,
    source_port: u16,
    /// Target desired-min-tx once Up, microseconds
    interval: u32,
    is_multi_hop: bool,
    socket: UdpSocket,
    state: RwLock<SharedState>,
    mgmt_tx: mpsc::Sender<MgmtOp>,
    mgmt_rx: Mutex<Option<mpsc::Receiver<MgmtOp>>>,
    timer_tx: mpsc::UnboundedSender<TimerCmd>,
    timer_rx: Mutex<Option<mpsc::UnboundedReceiver<TimerCmd>>>,
    shutdown_tx: watch::Sender<bool>,
    watcher_seq: AtomicU64,
}

impl Session {
    /// Validate the parameters, bind and connect the transmit socket.
    ///
    /// The socket is bound to the ephemeral source port, connected to the
    /// peer and sends with TTL 255 (RFC 5881 section 5).
    pub(crate) async fn connect(params: SessionParams) -> Result<Session> {
        if params.address.port() == 0 {
            return Err(Error::InvalidPort);
        }

        if params.detect_multiplier == 0 {
            return Err(Error::InvalidDetectionMultiplier);
        }

        let socket = bind_transmit_socket(&params)?;
        let socket = UdpSocket::from_std(socket)?;

        let (mgmt_tx, mgmt_rx) = mpsc::channel(MAILBOX_DEPTH);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Session {
            uuid: Uuid::now_v7(),
            address: params.address,
            source_port: params.source_port,
            interval: params.interval,
            is_multi_hop: params.is_multi_hop,
            socket,
            state: RwLock::new(SharedState {
                name: params.name,
                local: PeerState::initial_local(
                    params.discriminator,
                    params.required_min_rx_interval,
                    params.detect_multiplier,
                ),
                remote: PeerState::initial_remote(),
                auth_type: AuthenticationType::Reserved,
                poll_active: false,
                watchers: Vec::new(),
            }),
            mgmt_tx,
            mgmt_rx: Mutex::new(Some(mgmt_rx)),
            timer_tx,
            timer_rx: Mutex::new(Some(timer_rx)),
            shutdown_tx,
            watcher_seq: AtomicU64::new(0),
        })
    }

    /// Spawn the mailbox and timing loops. Idempotent.
    ///
    /// The shutdown receivers are subscribed here, before spawning, so a
    /// shutdown signalled right after `start` returns is never missed.
    pub fn start(self: &Arc<Self>) {
        if let Some(rx) = self.mgmt_rx.lock().take() {
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(mailbox_loop(Arc::clone(self), rx, shutdown));
        }
        if let Some(rx) = self.timer_rx.lock().take() {
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(timing_loop(Arc::clone(self), rx, shutdown));
        }
    }

    /// Signal both loops to exit at their next suspension point
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn is_multi_hop(&self) -> bool {
        self.is_multi_hop
    }

    /// Current local snapshot
    pub fn local(&self) -> PeerState {
        self.state.read().local
    }

    /// Current remote snapshot
    pub fn remote(&self) -> PeerState {
        self.state.read().remote
    }

    pub fn auth_type(&self) -> AuthenticationType {
        self.state.read().auth_type
    }

    pub(crate) fn poll_active(&self) -> bool {
        self.state.read().poll_active
    }

    /// Register a watcher for session state transitions
    pub fn watch(self: &Arc<Self>) -> Watcher {
        let id = self.watcher_seq.fetch_add(1, Ordering::Relaxed);
        let (handle, watcher) = watcher::new_watcher(id, Arc::downgrade(self));
        self.state.write().watchers.push(handle);
        watcher
    }

    pub(crate) fn remove_watcher(&self, id: u64) {
        self.state.write().watchers.retain(|w| w.id != id);
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.state.read().watchers.len()
    }

    /// Run a management operation on the mailbox and wait for its result
    async fn mgmt<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Session) -> Result<()> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.mgmt_tx
            .send(MgmtOp {
                f: Box::new(f),
                reply,
            })
            .await
            .map_err(|_| Error::PeerNotFound)?;

        rx.await.map_err(|_| Error::PeerNotFound)?
    }

    /// Replace the local snapshot; must only run on the mailbox.
    ///
    /// A session-state change publishes to the watchers, and a transition
    /// into Up switches the advertised transmit interval to the configured
    /// target.
    fn commit_local(&self, updates: &[PeerStateUpdate]) {
        let mut st = self.state.write();
        let old_state = st.local.session_state();
        st.local = st.local.with_updates(updates);

        if old_state != st.local.session_state() {
            if st.local.session_state() == SessionState::Up {
                st.local = st
                    .local
                    .with_updates(&[PeerStateUpdate::DesiredMinTxInterval(self.interval)]);
            }

            let event = StateChange {
                local: st.local,
                remote: st.remote,
            };
            st.watchers.retain(|w| w.notify(event));
        }
    }

    /// Replace the remote snapshot; must only run on the mailbox
    fn commit_remote(&self, updates: &[PeerStateUpdate]) {
        let mut st = self.state.write();
        st.remote = st.remote.with_updates(updates);
    }

    pub(crate) async fn apply_local(&self, updates: Vec<PeerStateUpdate>) -> Result<()> {
        self.mgmt(move |s| {
            s.commit_local(&updates);
            Ok(())
        })
        .await
    }

    pub(crate) async fn apply_remote(&self, updates: Vec<PeerStateUpdate>) -> Result<()> {
        self.mgmt(move |s| {
            s.commit_remote(&updates);
            Ok(())
        })
        .await
    }

    async fn clear_poll_active(&self) -> Result<()> {
        self.mgmt(|s| {
            s.state.write().poll_active = false;
            Ok(())
        })
        .await
    }

    /// Set the desired minimum transmit interval, microseconds.
    ///
    /// Increasing the interval while the session is Up would require a
    /// Poll Sequence (RFC 5880 section 6.8.3), which this revision does
    /// not implement.
    pub async fn set_desired_min_tx_interval(&self, interval: u32) -> Result<()> {
        self.mgmt(move |s| {
            let local = s.state.read().local;
            if interval > local.desired_min_tx_interval()
                && local.session_state() == SessionState::Up
            {
                return Err(Error::not_supported(
                    "increasing desired min tx interval while up requires a poll sequence",
                ));
            }
            s.commit_local(&[PeerStateUpdate::DesiredMinTxInterval(interval)]);
            Ok(())
        })
        .await
    }

    /// Set the required minimum receive interval, microseconds.
    ///
    /// Reducing the interval while the session is Up would require a Poll
    /// Sequence (RFC 5880 section 6.8.3).
    pub async fn set_required_min_rx_interval(&self, interval: u32) -> Result<()> {
        self.mgmt(move |s| {
            let local = s.state.read().local;
            if interval < local.required_min_rx_interval()
                && local.session_state() == SessionState::Up
            {
                return Err(Error::not_supported(
                    "reducing required min rx interval while up requires a poll sequence",
                ));
            }
            s.commit_local(&[PeerStateUpdate::RequiredMinRxInterval(interval)]);
            Ok(())
        })
        .await
    }

    pub async fn set_detect_multiplier(&self, multiplier: u8) -> Result<()> {
        self.mgmt(move |s| {
            s.commit_local(&[PeerStateUpdate::DetectMultiplier(multiplier)]);
            Ok(())
        })
        .await
    }

    /// Leave AdminDown; no-op in any other state
    pub async fn enable(&self) -> Result<()> {
        self.mgmt(|s| {
            if s.state.read().local.session_state() == SessionState::AdminDown {
                s.commit_local(&[PeerStateUpdate::State(SessionState::Down)]);
            }
            Ok(())
        })
        .await
    }

    /// Enter AdminDown; no-op if already there
    pub async fn disable(&self) -> Result<()> {
        self.mgmt(|s| {
            if s.state.read().local.session_state() != SessionState::AdminDown {
                s.commit_local(&[PeerStateUpdate::State(SessionState::AdminDown)]);
            }
            Ok(())
        })
        .await
    }

    /// Arm the transmit timer, microseconds from now
    pub(crate) fn schedule_send(&self, micros: u64) {
        let _ = self.timer_tx.send(TimerCmd::Transmit(micros));
    }

    /// Arm the detection expiry timer, microseconds from now
    pub(crate) fn schedule_expiry(&self, micros: u64) {
        let _ = self.timer_tx.send(TimerCmd::Expiry(micros));
    }

    /// Build an outgoing control packet from the current snapshots
    fn new_control_packet(&self, poll: bool, final_bit: bool) -> ControlPacket {
        let st = self.state.read();

        ControlPacket {
            version: 1,
            diagnostic: st.local.diagnostic(),
            state: st.local.session_state(),
            poll,
            final_bit,
            control_plane_independent: false,
            demand: false,
            multipoint: false,
            detect_multiplier: st.local.detect_multiplier(),
            my_discriminator: st.local.discriminator(),
            your_discriminator: st.remote.discriminator(),
            desired_min_tx_interval: st.local.desired_min_tx_interval(),
            required_min_rx_interval: st.local.required_min_rx_interval(),
            required_min_echo_rx_interval: 0,
            auth: None,
        }
    }

    /// Encode and transmit one packet; failures are logged and the next
    /// scheduled transmit proceeds normally
    async fn send(&self, packet: &ControlPacket) -> Result<()> {
        let bytes = packet.encode()?;

        if let Err(e) = self.socket.send(&bytes).await {
            warn!(peer = %self.address, error = %e, "error on write");
            return Err(e.into());
        }

        Ok(())
    }

    /// Feed one accepted inbound packet to the state machine (RFC 5880
    /// section 6.8.6)
    pub(crate) async fn handle_packet(&self, packet: &ControlPacket) -> Result<()> {
        // The A bit and the configured authentication must agree; a session
        // with authentication in use never accepts unauthenticated packets
        // and vice versa.
        if self.auth_type() != packet.auth_type() {
            return Err(Error::InvalidAuthenticationType);
        }

        if packet.auth_type() != AuthenticationType::Reserved {
            return Err(Error::not_implemented("packet authentication"));
        }

        let local = self.local();
        let remote = self.remote();

        let mut local_updates: Vec<PeerStateUpdate> = Vec::new();

        let remote_updates = vec![
            PeerStateUpdate::State(packet.state),
            PeerStateUpdate::DemandMode(packet.demand),
            PeerStateUpdate::Discriminator(packet.my_discriminator),
            PeerStateUpdate::RequiredMinRxInterval(packet.required_min_rx_interval),
            PeerStateUpdate::DetectMultiplier(packet.detect_multiplier),
        ];

        // A Final bit terminates a Poll Sequence in progress
        if self.poll_active() && packet.final_bit {
            self.clear_poll_active().await?;
        }

        // An AdminDown session discards everything, remote updates included
        if local.session_state() == SessionState::AdminDown {
            return Err(Error::SessionAdminDown);
        }

        if packet.state == SessionState::AdminDown {
            if local.session_state() != SessionState::Down {
                local_updates.push(PeerStateUpdate::Diagnostic(
                    DiagnosticCode::NeighborSignaledSessionDown,
                ));
                local_updates.push(PeerStateUpdate::State(SessionState::Down));
            }
        } else {
            match local.session_state() {
                SessionState::Down => match packet.state {
                    SessionState::Down => {
                        local_updates.push(PeerStateUpdate::Diagnostic(
                            DiagnosticCode::NoDiagnostic,
                        ));
                        local_updates.push(PeerStateUpdate::State(SessionState::Init));
                    }
                    SessionState::Init => {
                        local_updates.push(PeerStateUpdate::Diagnostic(
                            DiagnosticCode::NoDiagnostic,
                        ));
                        local_updates.push(PeerStateUpdate::State(SessionState::Up));
                    }
                    _ => {}
                },
                SessionState::Init => {
                    if matches!(packet.state, SessionState::Init | SessionState::Up) {
                        local_updates.push(PeerStateUpdate::Diagnostic(
                            DiagnosticCode::NoDiagnostic,
                        ));
                        local_updates.push(PeerStateUpdate::State(SessionState::Up));
                    }
                }
                SessionState::Up => {
                    if packet.state == SessionState::Down {
                        local_updates.push(PeerStateUpdate::Diagnostic(
                            DiagnosticCode::NeighborSignaledSessionDown,
                        ));
                        local_updates.push(PeerStateUpdate::State(SessionState::Down));
                    }
                }
                // AdminDown was rejected by the guard above
                SessionState::AdminDown => {}
            }
        }

        let new_local = local.with_updates(&local_updates);
        let new_remote = remote.with_updates(&remote_updates);

        self.apply_local(local_updates).await?;
        self.apply_remote(remote_updates).await?;

        // A Poll demands an immediate Final response; it does not re-arm
        // the transmit timer.
        if packet.poll {
            let reply = self.new_control_packet(false, true);
            let _ = self.send(&reply).await;
        }

        // Detection time is the remote multiplier times the agreed remote
        // transmit interval (RFC 5880 section 6.8.4); below Up the session
        // falls back to the long offline timeout.
        let negotiated_rx = new_local
            .required_min_rx_interval()
            .max(packet.desired_min_tx_interval);

        if new_local.session_state() == SessionState::Up {
            let detection_time =
                u64::from(negotiated_rx) * u64::from(new_remote.detect_multiplier());
            self.schedule_expiry(detection_time);
        } else {
            self.schedule_expiry(u64::from(OFFLINE_TIMEOUT));
        }

        Ok(())
    }

    /// Transmit-timer fire: send one packet and return the jittered period
    /// until the next one, microseconds
    async fn transmit_tick(&self, rng: &mut SmallRng) -> u64 {
        let mut local = self.local();
        let remote = self.remote();

        if remote.required_min_rx_interval() > 0 {
            let packet = self.new_control_packet(false, false);
            let _ = self.send(&packet).await;
        }

        if local.session_state() != SessionState::Up {
            // RFC 5880 section 6.8.3: below Up the advertised transmit
            // interval must be at least one second
            let _ = self
                .apply_local(vec![PeerStateUpdate::DesiredMinTxInterval(SLOW_TX_INTERVAL)])
                .await;
            local = local.with_updates(&[PeerStateUpdate::DesiredMinTxInterval(SLOW_TX_INTERVAL)]);
        }

        next_send_interval(&local, &remote, rng)
    }

    /// Expiry-timer fire: declare the session down if it was live
    async fn expiry_tick(&self) {
        let local = self.local();

        if matches!(
            local.session_state(),
            SessionState::Init | SessionState::Up
        ) {
            // RFC 5880 section 6.8.1: no packet for a detection time while
            // Init or Up takes the session down, and the remote minimum
            // receive interval resets to its initial value of 1
            let _ = self
                .apply_local(vec![
                    PeerStateUpdate::Diagnostic(DiagnosticCode::ControlDetectionTimeExpired),
                    PeerStateUpdate::State(SessionState::Down),
                ])
                .await;

            let _ = self
                .apply_remote(vec![PeerStateUpdate::RequiredMinRxInterval(1)])
                .await;
        }
    }
}

/// Compute the next transmit period in microseconds.
///
/// RFC 5880 section 6.8.7: the interval is jittered down by 0-25%, and
/// with a detect multiplier of 1 it must not exceed 90% of the negotiated
/// interval. The arithmetic is done in u64 so maximal intervals cannot
/// overflow.
fn next_send_interval(local: &PeerState, remote: &PeerState, rng: &mut SmallRng) -> u64 {
    let base = u64::from(
        local
            .desired_min_tx_interval()
            .max(remote.required_min_rx_interval()),
    );

    let jitter: u64 = rng.gen_range(0..=25);
    let mut period = base - base * jitter / 100;

    if local.detect_multiplier() == 1 {
        period = period.min(base * 90 / 100);
    }

    period
}

/// Bind the transmit socket to the ephemeral source port, connect it to
/// the peer and set the send TTL to 255
fn bind_transmit_socket(params: &SessionParams) -> Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if params.address.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if params.address.is_ipv4() {
        socket.set_ttl(255)?;
    } else {
        socket.set_unicast_hops_v6(255)?;
    }

    let bind_addr: SocketAddr = if params.address.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], params.source_port))
    } else {
        SocketAddr::from(([0u16; 8], params.source_port))
    };

    socket.bind(&bind_addr.into())?;
    socket.connect(&params.address.into())?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Drains the management mailbox, one operation at a time
async fn mailbox_loop(
    session: Arc<Session>,
    mut mgmt_rx: mpsc::Receiver<MgmtOp>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            op = mgmt_rx.recv() => match op {
                Some(op) => {
                    let result = (op.f)(&session);
                    let _ = op.reply.send(result);
                }
                None => return,
            },
            _ = shutdown.changed() => {
                debug!(peer = %session.address, "session mailbox stopped");
                return;
            }
        }
    }
}

/// Multiplexes the transmit timer, the expiry timer, timer re-arm commands
/// and the shutdown signal
async fn timing_loop(
    session: Arc<Session>,
    mut timer_rx: mpsc::UnboundedReceiver<TimerCmd>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Jitter must not correlate across sessions, so each timing loop owns
    // its own small RNG.
    let mut rng = SmallRng::from_entropy();

    let mut transmit_at = Instant::now() + FAR_FUTURE;
    let mut expiry_at = Instant::now() + FAR_FUTURE;

    loop {
        tokio::select! {
            _ = time::sleep_until(transmit_at) => {
                let period = session.transmit_tick(&mut rng).await;
                transmit_at = Instant::now() + Duration::from_micros(period);
            }
            _ = time::sleep_until(expiry_at) => {
                expiry_at = Instant::now() + FAR_FUTURE;
                session.expiry_tick().await;
            }
            cmd = timer_rx.recv() => match cmd {
                Some(TimerCmd::Transmit(micros)) => {
                    transmit_at = Instant::now() + Duration::from_micros(micros);
                }
                Some(TimerCmd::Expiry(micros)) => {
                    expiry_at = Instant::now() + Duration::from_micros(micros);
                }
                None => return,
            },
            _ = shutdown.changed() => {
                debug!(peer = %session.address, "session timing loop stopped");
                return;
            }
        }
    }
}
