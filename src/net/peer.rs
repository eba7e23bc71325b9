//! A single peer connection: handshake state machine, framing I/O, and
//! keepalive.
//!
//! The I/O runs as three tokio tasks (read, write, timer) per connection.
//! Protocol decisions stay in the network manager's event loop; the tasks
//! only frame bytes, enforce size and time limits, and report events. A
//! peer never tears itself down from inside a handler — disconnection is
//! signalled, the handler returns, and cleanup happens when the read task
//! reports back.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::net::message::{Message, VersionMessage, MIN_PROTOCOL_VERSION};
use crate::net::wire::{
    self, FrameHeader, WireError, FRAME_HEADER_SIZE, RECV_BUFFER_LIMIT,
};
use crate::primitives::Hash256;

pub type PeerId = u64;

/// Handshake must complete within this window.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 60;
/// A silent peer is dropped after this long.
pub const INACTIVITY_TIMEOUT_SECS: u64 = 20 * 60;
/// Keepalive ping cadence.
pub const PING_INTERVAL_SECS: u64 = 2 * 60;
/// An unanswered ping disconnects after this long.
pub const PING_TIMEOUT_SECS: u64 = 20 * 60;

/// Cap on the per-peer announced-hash memory.
const MAX_ANNOUNCED_HASHES: usize = 4096;

/// Why the connection exists; drives relay and eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    OutboundFullRelay,
    BlockRelayOnly,
    Feeler,
    Inbound,
}

impl ConnectionType {
    pub fn is_outbound(&self) -> bool {
        !matches!(self, ConnectionType::Inbound)
    }

    /// Block-relay-only links never exchange addresses.
    pub fn relays_addr(&self) -> bool {
        !matches!(self, ConnectionType::BlockRelayOnly | ConnectionType::Feeler)
    }
}

/// Connection lifecycle per the handshake protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    Connected,
    VersionSent,
    Ready,
    Disconnecting,
}

/// What the state machine wants done after a handshake input.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Send our VERACK (outbound path: their VERSION arrived).
    SendVerack,
    /// Send VERACK plus our own VERSION (inbound path).
    SendVerackAndVersion,
    /// Handshake complete.
    BecameReady,
    /// Duplicate or stale input; drop it silently.
    Ignore,
    Disconnect(&'static str),
}

/// Permission flags carried by manually-added or whitelisted peers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerPermissions {
    pub no_ban: bool,
    pub manual: bool,
}

/// Lock-free per-peer statistics (unix seconds / byte counts).
#[derive(Debug)]
pub struct PeerStats {
    pub connected_at: u64,
    pub last_send: AtomicU64,
    pub last_recv: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_recv: AtomicU64,
    pub ping_time_ms: AtomicU64,
    /// Nonce of the outstanding ping; zero when none.
    pub ping_nonce: AtomicU64,
    pub last_ping_sent: AtomicU64,
    /// Millisecond send time of the outstanding ping, for RTT.
    pub ping_sent_at_ms: AtomicU64,
}

impl PeerStats {
    fn new(now: u64) -> Self {
        PeerStats {
            connected_at: now,
            last_send: AtomicU64::new(now),
            last_recv: AtomicU64::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            ping_time_ms: AtomicU64::new(0),
            ping_nonce: AtomicU64::new(0),
            last_ping_sent: AtomicU64::new(now),
            ping_sent_at_ms: AtomicU64::new(0),
        }
    }
}

/// Events the I/O tasks report to the network manager.
#[derive(Debug)]
pub enum PeerEvent {
    Message { peer: PeerId, message: Message },
    Violation { peer: PeerId, error: WireError },
    Disconnected { peer: PeerId, reason: String },
}

pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub conn_type: ConnectionType,
    pub permissions: PeerPermissions,
    /// Nonce we put in our VERSION; used for self-connection detection.
    pub local_nonce: u64,
    pub stats: PeerStats,

    state: Mutex<HandshakeState>,
    version: Mutex<Option<VersionMessage>>,
    pub misbehavior: AtomicU32,
    pub unconnecting_headers: AtomicU32,
    wants_sendheaders: AtomicBool,
    /// GETADDR is answered once per connection.
    getaddr_served: AtomicBool,
    announced: Mutex<HashSet<Hash256>>,

    tx: mpsc::UnboundedSender<Message>,
    shutdown: watch::Sender<bool>,
    disconnect_reported: AtomicBool,
    /// Latched when the handshake first completes; survives disconnection.
    completed_handshake: AtomicBool,
}

impl Peer {
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        conn_type: ConnectionType,
        permissions: PeerPermissions,
        local_nonce: u64,
        now: u64,
    ) -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let initial_state = if conn_type.is_outbound() {
            HandshakeState::Connecting
        } else {
            HandshakeState::Connected
        };
        let peer = Arc::new(Peer {
            id,
            addr,
            conn_type,
            permissions,
            local_nonce,
            stats: PeerStats::new(now),
            state: Mutex::new(initial_state),
            version: Mutex::new(None),
            misbehavior: AtomicU32::new(0),
            unconnecting_headers: AtomicU32::new(0),
            wants_sendheaders: AtomicBool::new(false),
            getaddr_served: AtomicBool::new(false),
            announced: Mutex::new(HashSet::new()),
            tx,
            shutdown,
            disconnect_reported: AtomicBool::new(false),
            completed_handshake: AtomicBool::new(false),
        });
        (peer, rx, shutdown_rx)
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == HandshakeState::Ready
    }

    /// True once the handshake has ever completed, even after disconnect.
    pub fn completed_handshake(&self) -> bool {
        self.completed_handshake.load(Ordering::Relaxed)
    }

    pub fn version_info(&self) -> Option<VersionMessage> {
        self.version.lock().clone()
    }

    pub fn start_height(&self) -> Option<i32> {
        self.version.lock().as_ref().map(|v| v.start_height)
    }

    /// Queues a message for the write task. Errors only after shutdown.
    pub fn send(&self, message: Message) -> bool {
        trace!(target: "p2p", peer = self.id, command = message.command(), "queueing message");
        self.tx.send(message).is_ok()
    }

    /// Outbound connect succeeded: our VERSION goes first.
    pub fn mark_version_sent(&self) {
        let mut state = self.state.lock();
        if *state == HandshakeState::Connecting {
            *state = HandshakeState::VersionSent;
        }
    }

    /// Handshake input: remote VERSION.
    pub fn on_version(&self, version: VersionMessage) -> HandshakeAction {
        let mut state = self.state.lock();
        if version.version < MIN_PROTOCOL_VERSION {
            return HandshakeAction::Disconnect("obsolete protocol version");
        }
        {
            let mut slot = self.version.lock();
            if slot.is_some() {
                // Duplicate VERSION after completion: no state change.
                return HandshakeAction::Ignore;
            }
            *slot = Some(version);
        }
        match (*state, self.conn_type.is_outbound()) {
            (HandshakeState::VersionSent, true) => HandshakeAction::SendVerack,
            (HandshakeState::Connected, false) => {
                *state = HandshakeState::VersionSent;
                HandshakeAction::SendVerackAndVersion
            }
            _ => HandshakeAction::Disconnect("version out of order"),
        }
    }

    /// Handshake input: remote VERACK.
    pub fn on_verack(&self) -> HandshakeAction {
        let mut state = self.state.lock();
        match *state {
            HandshakeState::VersionSent if self.version.lock().is_some() => {
                *state = HandshakeState::Ready;
                self.completed_handshake.store(true, Ordering::Relaxed);
                HandshakeAction::BecameReady
            }
            HandshakeState::Ready => HandshakeAction::Ignore,
            _ => HandshakeAction::Disconnect("verack before version"),
        }
    }

    pub fn set_sendheaders(&self) {
        self.wants_sendheaders.store(true, Ordering::Relaxed);
    }

    pub fn wants_headers_push(&self) -> bool {
        self.wants_sendheaders.load(Ordering::Relaxed)
    }

    /// True the first time only; GETADDR gets one reply per connection.
    pub fn claim_getaddr_reply(&self) -> bool {
        !self.getaddr_served.swap(true, Ordering::Relaxed)
    }

    /// Records an announcement; false when this hash was already sent (the
    /// caller skips the duplicate).
    pub fn note_announced(&self, hash: &Hash256) -> bool {
        let mut announced = self.announced.lock();
        if announced.len() >= MAX_ANNOUNCED_HASHES {
            announced.clear();
        }
        announced.insert(*hash)
    }

    /// Signals the I/O tasks to stop. Safe to call from any context; actual
    /// teardown happens on the reactor when the read task exits.
    pub fn start_disconnect(&self) {
        let mut state = self.state.lock();
        if *state != HandshakeState::Disconnecting {
            debug!(target: "p2p", peer = self.id, addr = %self.addr, "disconnect scheduled");
            *state = HandshakeState::Disconnecting;
        }
        let _ = self.shutdown.send(true);
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state() == HandshakeState::Disconnecting
    }

    /// True exactly once, for the task that gets to report the disconnect.
    fn claim_disconnect_report(&self) -> bool {
        !self.disconnect_reported.swap(true, Ordering::SeqCst)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Spawns the read/write/timer tasks for an established TCP stream.
pub fn spawn_io(
    peer: Arc<Peer>,
    stream: TcpStream,
    magic: [u8; 4],
    events: mpsc::UnboundedSender<PeerEvent>,
    outgoing: mpsc::UnboundedReceiver<Message>,
    shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    tokio::spawn(read_loop(
        peer.clone(),
        read_half,
        magic,
        events.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(write_loop(peer.clone(), write_half, magic, outgoing, shutdown.clone()));
    tokio::spawn(timer_loop(peer, shutdown));
}

async fn read_loop(
    peer: Arc<Peer>,
    mut read: OwnedReadHalf,
    magic: [u8; 4],
    events: mpsc::UnboundedSender<PeerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let reason = loop {
        let mut head = [0u8; FRAME_HEADER_SIZE];
        let header: FrameHeader = tokio::select! {
            biased;
            _ = shutdown.changed() => break "disconnect requested".to_string(),
            read_result = read.read_exact(&mut head) => {
                if read_result.is_err() {
                    break "connection closed".to_string();
                }
                match wire::decode_frame_header(&head, magic) {
                    Ok(h) => h,
                    Err(e) => {
                        let _ = events.send(PeerEvent::Violation { peer: peer.id, error: e });
                        break "bad frame header".to_string();
                    }
                }
            }
        };

        // The watermark bounds what one message may buffer; checked before
        // the payload allocation.
        if header.length as usize > RECV_BUFFER_LIMIT {
            let _ = events.send(PeerEvent::Violation {
                peer: peer.id,
                error: WireError::Oversized(header.length as usize),
            });
            break "oversized message".to_string();
        }

        let mut payload = vec![0u8; header.length as usize];
        tokio::select! {
            biased;
            _ = shutdown.changed() => break "disconnect requested".to_string(),
            read_result = read.read_exact(&mut payload) => {
                if read_result.is_err() {
                    break "connection closed mid-payload".to_string();
                }
            }
        }

        let now = unix_now();
        peer.stats.last_recv.store(now, Ordering::Relaxed);
        peer.stats
            .bytes_recv
            .fetch_add((FRAME_HEADER_SIZE + payload.len()) as u64, Ordering::Relaxed);

        if let Err(e) = wire::verify_checksum(&payload, &header.checksum) {
            let _ = events.send(PeerEvent::Violation { peer: peer.id, error: e });
            break "checksum mismatch".to_string();
        }
        match Message::decode(&header.command, &payload) {
            Ok(message) => {
                let _ = events.send(PeerEvent::Message {
                    peer: peer.id,
                    message,
                });
            }
            Err(WireError::UnknownCommand(cmd)) => {
                // Unknown commands are tolerated for forward compatibility.
                trace!(target: "p2p", peer = peer.id, command = %cmd, "ignoring unknown command");
            }
            Err(e) => {
                let _ = events.send(PeerEvent::Violation { peer: peer.id, error: e });
                break "malformed payload".to_string();
            }
        }
    };

    peer.start_disconnect();
    if peer.claim_disconnect_report() {
        let _ = events.send(PeerEvent::Disconnected {
            peer: peer.id,
            reason,
        });
    }
}

async fn write_loop(
    peer: Arc<Peer>,
    mut write: OwnedWriteHalf,
    magic: [u8; 4],
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            msg = outgoing.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };
        let frame = wire::encode_frame(magic, message.command(), &message.encode_payload());
        if write.write_all(&frame).await.is_err() {
            peer.start_disconnect();
            break;
        }
        peer.stats.last_send.store(unix_now(), Ordering::Relaxed);
        peer.stats
            .bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
    }
    let _ = write.shutdown().await;
}

/// Watches the deadline set: handshake, inactivity, and ping liveness.
async fn timer_loop(peer: Arc<Peer>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        let now = unix_now();

        if !peer.is_ready() {
            if now.saturating_sub(peer.stats.connected_at) > HANDSHAKE_TIMEOUT_SECS {
                debug!(target: "p2p", peer = peer.id, "handshake timeout");
                peer.start_disconnect();
            }
            continue;
        }

        let last_recv = peer.stats.last_recv.load(Ordering::Relaxed);
        if now.saturating_sub(last_recv) > INACTIVITY_TIMEOUT_SECS {
            debug!(target: "p2p", peer = peer.id, "inactivity timeout");
            peer.start_disconnect();
            continue;
        }

        let outstanding = peer.stats.ping_nonce.load(Ordering::Relaxed);
        let last_ping = peer.stats.last_ping_sent.load(Ordering::Relaxed);
        if outstanding != 0 {
            if now.saturating_sub(last_ping) > PING_TIMEOUT_SECS {
                debug!(target: "p2p", peer = peer.id, "ping timeout");
                peer.start_disconnect();
            }
        } else if now.saturating_sub(last_ping) > PING_INTERVAL_SECS {
            let nonce: u64 = rand::random::<u64>() | 1;
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            peer.stats.ping_nonce.store(nonce, Ordering::Relaxed);
            peer.stats.last_ping_sent.store(now, Ordering::Relaxed);
            peer.stats.ping_sent_at_ms.store(now_ms, Ordering::Relaxed);
            peer.send(Message::Ping(nonce));
        }
    }
}
