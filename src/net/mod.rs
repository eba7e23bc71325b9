//! The peer-to-peer layer.
//!
//! [`NetworkManager`] owns the listener, the outbound dialer, the feeler
//! scheduler, and the single event loop that every per-connection task
//! reports into. Protocol decisions all happen on that loop, so handlers
//! for one connection are never concurrent with each other.

pub mod discovery;
pub mod message;
pub mod peer;
pub mod peer_manager;
pub mod sync;
pub mod wire;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::chain::Chainstate;
use crate::consensus::Network;
use crate::net::discovery::AddrBook;
use crate::net::message::{AddrEntry, Message, VersionMessage, NODE_NETWORK, PROTOCOL_VERSION};
use crate::net::peer::{
    spawn_io, ConnectionType, HandshakeAction, Peer, PeerEvent, PeerId, PeerPermissions,
};
use crate::net::peer_manager::{PeerManager, PeerManagerConfig};
use crate::net::sync::SyncManager;
use crate::net::wire::{WireError, MAX_ADDR_ENTRIES};
use crate::notifications::{Event, NotificationHub, Subscription};
use crate::primitives::Hash256;
use crate::time::Clock;

/// User agent advertised in VERSION.
pub const USER_AGENT: &str = concat!("/ember:", env!("CARGO_PKG_VERSION"), "/");

/// Outbound slots reserved for block-relay-only connections.
const BLOCK_RELAY_SLOTS: usize = 2;

/// Dial-storm guard: new outbound attempts per connect cycle.
const MAX_DIALS_PER_CYCLE: usize = 3;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Network,
    pub listen_enabled: bool,
    pub listen_port: u16,
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub connect_interval: Duration,
    pub maintenance_interval: Duration,
    pub datadir: PathBuf,
}

pub struct NetworkManager {
    config: NetworkConfig,
    magic: [u8; 4],
    chain: Arc<Chainstate>,
    pub peers: Arc<PeerManager>,
    pub sync: Arc<SyncManager>,
    clock: Arc<Clock>,
    hub: Arc<NotificationHub>,
    addr_book: Mutex<AddrBook>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    tip_rx: Mutex<Option<mpsc::UnboundedReceiver<Hash256>>>,
    shutdown: watch::Sender<bool>,
    _tip_subscription: Subscription,
}

impl NetworkManager {
    pub fn new(
        config: NetworkConfig,
        chain: Arc<Chainstate>,
        clock: Arc<Clock>,
        hub: Arc<NotificationHub>,
    ) -> Arc<Self> {
        let peers = Arc::new(PeerManager::new(
            PeerManagerConfig {
                max_outbound: config.max_outbound,
                max_inbound: config.max_inbound,
            },
            hub.clone(),
        ));
        let sync = Arc::new(SyncManager::new(
            chain.clone(),
            peers.clone(),
            clock.clone(),
            hub.clone(),
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        // Tip changes are forwarded out of the publisher's context and
        // announced from the event loop, never under the consensus lock.
        let (tip_tx, tip_rx) = mpsc::unbounded_channel();
        let tip_subscription = hub.subscribe(move |event| {
            if let Event::NewTip { hash, .. } = event {
                let _ = tip_tx.send(*hash);
            }
        });

        let magic = config.network.magic();
        Arc::new(NetworkManager {
            config,
            magic,
            chain,
            peers,
            sync,
            clock,
            hub,
            addr_book: Mutex::new(AddrBook::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tip_rx: Mutex::new(Some(tip_rx)),
            shutdown,
            _tip_subscription: tip_subscription,
        })
    }

    /// Starts every network task. Returns immediately; tasks run until
    /// [`Self::stop`].
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.load_persisted_state();

        if self.config.listen_enabled {
            let listener =
                TcpListener::bind(("0.0.0.0", self.config.listen_port)).await?;
            info!(target: "p2p", port = self.config.listen_port, "listening for peers");
            tokio::spawn(self.clone().accept_loop(listener));
        }

        tokio::spawn(self.clone().event_loop());
        tokio::spawn(self.clone().connect_loop());
        tokio::spawn(self.clone().feeler_loop());
        tokio::spawn(self.clone().maintenance_loop());
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.peers.for_each(|peer| peer.start_disconnect());
        self.persist_state();
    }

    fn load_persisted_state(&self) {
        let banlist = self.config.datadir.join("banlist.json");
        match self.peers.load_banlist(&banlist, self.clock.now()) {
            Ok(n) if n > 0 => info!(target: "p2p", bans = n, "ban list loaded"),
            Ok(_) => {}
            Err(e) => warn!(target: "p2p", error = %e, "could not load ban list"),
        }
    }

    fn persist_state(&self) {
        let datadir = &self.config.datadir;
        if let Err(e) = self.peers.save_banlist(&datadir.join("banlist.json")) {
            warn!(target: "p2p", error = %e, "could not save ban list");
        }
        let anchors = self.peers.anchor_candidates();
        if let Err(e) = discovery::save_anchors(&datadir.join("anchors.json"), &anchors) {
            warn!(target: "p2p", error = %e, "could not save anchors");
        } else if !anchors.is_empty() {
            info!(target: "p2p", count = anchors.len(), "anchors saved");
        }
    }

    // ---- loops ----------------------------------------------------------

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(target: "p2p", error = %e, "accept failed");
                    continue;
                }
            };
            self.handle_inbound(stream, addr);
        }
    }

    fn handle_inbound(&self, stream: TcpStream, addr: SocketAddr) {
        let now = self.clock.now();
        let id = self.peers.next_id();
        let (peer, outgoing, shutdown_rx) = Peer::new(
            id,
            addr,
            ConnectionType::Inbound,
            PeerPermissions::default(),
            0,
            now,
        );
        if let Err(e) = self.peers.try_add_peer(peer.clone(), now) {
            debug!(target: "p2p", %addr, error = %e, "inbound refused");
            return; // stream drops here, before any buffering
        }
        debug!(target: "p2p", peer = id, %addr, "inbound connection");
        spawn_io(
            peer,
            stream,
            self.magic,
            self.events_tx.clone(),
            outgoing,
            shutdown_rx,
        );
    }

    async fn event_loop(self: Arc<Self>) {
        let mut events = self
            .events_rx
            .lock()
            .take()
            .expect("event loop started twice");
        let mut tips = self
            .tip_rx
            .lock()
            .take()
            .expect("event loop started twice");
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                event = events.recv() => {
                    let Some(event) = event else { return };
                    self.handle_event(event);
                }
                tip = tips.recv() => {
                    if let Some(hash) = tip {
                        self.sync.announce_tip(hash);
                    }
                }
            }
        }
    }

    async fn connect_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();

        // Bootstrap: anchors first, then DNS seeds if the book is empty.
        for addr in discovery::load_anchors(&self.config.datadir.join("anchors.json")) {
            info!(target: "p2p", %addr, "dialing anchor");
            self.clone()
                .dial(addr, ConnectionType::BlockRelayOnly, PeerPermissions::default());
        }
        if self.addr_book.lock().is_empty() {
            let seeds = self.config.network.dns_seeds();
            if !seeds.is_empty() {
                let found =
                    discovery::bootstrap_dns_seeds(seeds, self.config.network.default_port())
                        .await;
                let now = self.clock.now();
                let mut book = self.addr_book.lock();
                for addr in found {
                    book.add(addr, NODE_NETWORK, now);
                }
            }
        }

        let mut ticker = tokio::time::interval(self.config.connect_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            let mut dialed = 0;
            while self.peers.has_outbound_slot() && dialed < MAX_DIALS_PER_CYCLE {
                let Some(addr) = self.pick_outbound_addr() else {
                    break;
                };
                let conn_type = if self.block_relay_count() < BLOCK_RELAY_SLOTS {
                    ConnectionType::BlockRelayOnly
                } else {
                    ConnectionType::OutboundFullRelay
                };
                self.clone()
                    .dial(addr, conn_type, PeerPermissions::default());
                dialed += 1;
            }
        }
    }

    async fn feeler_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut rng = StdRng::from_entropy();
        loop {
            let delay = discovery::feeler_delay(
                &mut rng,
                Duration::from_secs(discovery::FEELER_INTERVAL_SECS),
            );
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let target = {
                let book = self.addr_book.lock();
                book.select_feeler(&mut rng)
            };
            if let Some(addr) = target {
                debug!(target: "p2p", %addr, "feeler probe");
                self.clone()
                    .dial(addr, ConnectionType::Feeler, PeerPermissions::default());
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            self.chain.maintenance();
            self.sync.check_stall();
            self.sync.maybe_start_sync();
            self.addr_book.lock().cleanup(self.clock.now());
        }
    }

    // ---- dialing --------------------------------------------------------

    fn pick_outbound_addr(&self) -> Option<SocketAddr> {
        let connected: HashSet<std::net::IpAddr> = {
            let mut set = HashSet::new();
            self.peers.for_each(|p| {
                set.insert(p.addr.ip());
            });
            set
        };
        let now = self.clock.now();
        let book = self.addr_book.lock();
        let mut rng = StdRng::from_entropy();
        let peers = self.peers.clone();
        book.select(
            &mut rng,
            &|addr| connected.contains(&addr.ip()) || peers.is_blocked(&addr.ip(), now),
            now,
        )
    }

    fn block_relay_count(&self) -> usize {
        let mut count = 0;
        self.peers.for_each(|p| {
            if p.conn_type == ConnectionType::BlockRelayOnly {
                count += 1;
            }
        });
        count
    }

    /// Dials a manually requested peer (the `addnode` verb).
    pub fn add_manual_peer(self: &Arc<Self>, addr: SocketAddr) {
        self.clone().dial(
            addr,
            ConnectionType::OutboundFullRelay,
            PeerPermissions {
                no_ban: false,
                manual: true,
            },
        );
    }

    /// Disconnects every connection to `addr`. Returns how many matched.
    pub fn disconnect_by_addr(&self, addr: &SocketAddr) -> usize {
        let mut matched = 0;
        self.peers.for_each(|peer| {
            if peer.addr == *addr {
                peer.start_disconnect();
                matched += 1;
            }
        });
        matched
    }

    pub fn addr_book_size(&self) -> usize {
        self.addr_book.lock().len()
    }

    fn dial(self: Arc<Self>, addr: SocketAddr, conn_type: ConnectionType, permissions: PeerPermissions) {
        tokio::spawn(async move {
            let now = self.clock.now();
            self.addr_book.lock().mark_attempt(&addr, now);
            let stream =
                match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => stream,
                    _ => {
                        debug!(target: "p2p", %addr, "dial failed");
                        self.addr_book.lock().mark_failure(&addr);
                        return;
                    }
                };

            let id = self.peers.next_id();
            let nonce: u64 = rand::random::<u64>() | 1;
            let (peer, outgoing, shutdown_rx) =
                Peer::new(id, addr, conn_type, permissions, nonce, now);
            if let Err(e) = self.peers.try_add_peer(peer.clone(), now) {
                debug!(target: "p2p", %addr, error = %e, "outbound refused locally");
                return;
            }
            self.peers.register_outbound_nonce(nonce);
            spawn_io(
                peer.clone(),
                stream,
                self.magic,
                self.events_tx.clone(),
                outgoing,
                shutdown_rx,
            );
            peer.send(Message::Version(self.build_version(&peer)));
            peer.mark_version_sent();
            debug!(target: "p2p", peer = id, %addr, kind = ?conn_type, "outbound connection");
        });
    }

    fn build_version(&self, peer: &Arc<Peer>) -> VersionMessage {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: NODE_NETWORK,
            timestamp: self.clock.now() as i64,
            addr_recv: peer.addr,
            addr_from: SocketAddr::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                self.config.listen_port,
            ),
            nonce: peer.local_nonce,
            user_agent: USER_AGENT.to_string(),
            start_height: self.chain.block_count().min(i32::MAX as u64) as i32,
        }
    }

    // ---- event handling --------------------------------------------------

    fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Message { peer, message } => self.handle_message(peer, message),
            PeerEvent::Violation { peer, error } => self.handle_violation(peer, error),
            PeerEvent::Disconnected { peer, reason } => self.handle_disconnected(peer, &reason),
        }
    }

    fn handle_message(&self, peer_id: PeerId, message: Message) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        if peer.is_disconnecting() {
            return;
        }

        match message {
            Message::Version(version) => self.handle_version(&peer, version),
            Message::Verack => match peer.on_verack() {
                HandshakeAction::BecameReady => self.on_peer_ready(&peer),
                HandshakeAction::Ignore => {}
                _ => peer.start_disconnect(),
            },
            other if !peer.is_ready() => {
                // Application traffic before the handshake completes.
                debug!(target: "p2p", peer = peer_id, command = other.command(),
                       "message before handshake completion");
                peer.start_disconnect();
            }
            Message::Ping(nonce) => {
                peer.send(Message::Pong(nonce));
            }
            Message::Pong(nonce) => {
                let expected = peer.stats.ping_nonce.load(std::sync::atomic::Ordering::Relaxed);
                if expected != 0 && expected == nonce {
                    let now_ms = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0);
                    let sent = peer
                        .stats
                        .ping_sent_at_ms
                        .load(std::sync::atomic::Ordering::Relaxed);
                    peer.stats
                        .ping_time_ms
                        .store(now_ms.saturating_sub(sent), std::sync::atomic::Ordering::Relaxed);
                    peer.stats
                        .ping_nonce
                        .store(0, std::sync::atomic::Ordering::Relaxed);
                }
            }
            Message::Addr(entries) => {
                if peer.conn_type.relays_addr() {
                    let now = self.clock.now();
                    let mut book = self.addr_book.lock();
                    for entry in &entries {
                        book.add(entry.addr, entry.services, (entry.time as u64).min(now));
                    }
                    debug!(target: "p2p", peer = peer_id, count = entries.len(), "addresses learned");
                }
            }
            Message::GetAddr => {
                if peer.conn_type.relays_addr() && peer.claim_getaddr_reply() {
                    let mut rng = StdRng::from_entropy();
                    let sample = self.addr_book.lock().sample(&mut rng, MAX_ADDR_ENTRIES);
                    let entries: Vec<AddrEntry> = sample
                        .into_iter()
                        .map(|info| AddrEntry {
                            time: info.last_seen.min(u32::MAX as u64) as u32,
                            services: info.services,
                            addr: info.addr,
                        })
                        .collect();
                    peer.send(Message::Addr(entries));
                }
            }
            Message::Inv(items) => self.sync.handle_inv(peer_id, &items),
            Message::GetData(items) => {
                // Headers-only node: full blocks are never served.
                peer.send(Message::NotFound(items));
            }
            Message::NotFound(_) => {}
            Message::GetHeaders { locator, stop, .. } => {
                self.sync.handle_getheaders(peer_id, &locator, &stop);
            }
            Message::Headers(headers) => {
                self.sync.handle_headers(peer_id, headers);
            }
            Message::SendHeaders => peer.set_sendheaders(),
        }
    }

    fn handle_version(&self, peer: &Arc<Peer>, version: VersionMessage) {
        // Self-connection: our own outbound nonce coming back at us.
        if peer.conn_type == ConnectionType::Inbound
            && self.peers.is_self_connection(version.nonce)
        {
            info!(target: "p2p", peer = peer.id, "self-connection detected, dropping");
            peer.start_disconnect();
            return;
        }
        let offset = version.timestamp - self.clock.now() as i64;
        match peer.on_version(version) {
            HandshakeAction::SendVerack => {
                self.clock.add_peer_offset(offset);
                peer.send(Message::Verack);
            }
            HandshakeAction::SendVerackAndVersion => {
                self.clock.add_peer_offset(offset);
                peer.send(Message::Verack);
                peer.send(Message::Version(self.build_version(peer)));
            }
            HandshakeAction::Ignore => {}
            HandshakeAction::Disconnect(reason) => {
                debug!(target: "p2p", peer = peer.id, reason, "handshake failure");
                peer.start_disconnect();
            }
            HandshakeAction::BecameReady => unreachable!("version never completes a handshake"),
        }
    }

    fn on_peer_ready(&self, peer: &Arc<Peer>) {
        info!(target: "p2p", peer = peer.id, addr = %peer.addr, kind = ?peer.conn_type,
              agent = peer.version_info().map(|v| v.user_agent).unwrap_or_default(),
              "peer ready");
        if peer.conn_type.is_outbound() {
            self.peers.release_outbound_nonce(peer.local_nonce);
            self.addr_book
                .lock()
                .mark_success(&peer.addr, self.clock.now());
        }
        if peer.conn_type == ConnectionType::Feeler {
            // The probe answered; that is all a feeler wanted to know.
            peer.start_disconnect();
            return;
        }
        peer.send(Message::SendHeaders);
        if peer.conn_type.relays_addr() {
            peer.send(Message::GetAddr);
        }
        self.sync.maybe_start_sync();
    }

    fn handle_violation(&self, peer_id: PeerId, error: WireError) {
        if let WireError::Oversized(len) = error {
            warn!(target: "p2p", peer = peer_id, len, "oversized message");
            self.hub.publish(Event::OversizedMessage { peer_id });
            self.peers.misbehaving(
                peer_id,
                PeerManager::penalty_for(&crate::consensus::validation::ValidationError::OversizedMessage),
                "oversized message",
                self.clock.now(),
            );
        } else {
            debug!(target: "p2p", peer = peer_id, error = %error, "protocol violation");
        }
    }

    fn handle_disconnected(&self, peer_id: PeerId, reason: &str) {
        let Some(peer) = self.peers.remove_peer(peer_id) else {
            return;
        };
        debug!(target: "p2p", peer = peer_id, addr = %peer.addr, reason, "peer disconnected");
        if peer.conn_type.is_outbound() {
            self.peers.release_outbound_nonce(peer.local_nonce);
            if !peer.completed_handshake() {
                // Never finished the handshake; count it against the address.
                self.addr_book.lock().mark_failure(&peer.addr);
            }
        }
        self.chain.on_peer_disconnected(peer_id);
        self.sync.on_peer_disconnected(peer_id);
        self.sync.maybe_start_sync();
    }
}
