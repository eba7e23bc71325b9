//! Peer lifecycle: admission, eviction, misbehavior scoring, and bans.
//!
//! The registry is the single authority on connection counts. Admission and
//! eviction happen under one lock acquisition, so a burst of inbound
//! connections can never race the cap. Eviction never touches manual or
//! no-ban peers and always spares the newest few connections, which keeps a
//! rotating attacker from washing out long-lived peers.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consensus::validation::ValidationError;
use crate::net::peer::{ConnectionType, Peer, PeerId};
use crate::notifications::{Event, NotificationHub};

/// Score at which a peer is discouraged and dropped.
pub const MISBEHAVIOR_THRESHOLD: u32 = 100;

/// How long a discouraged address stays unwelcome (in-memory only).
pub const DISCOURAGEMENT_SECS: u64 = 24 * 60 * 60;

/// The newest inbound connections are never eviction candidates.
const EVICTION_PROTECT_NEWEST: usize = 8;

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub max_outbound: usize,
    pub max_inbound: usize,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        PeerManagerConfig {
            max_outbound: 8,
            max_inbound: 125,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("address is banned or discouraged")]
    Banned,
    #[error("connection slots are full")]
    AtCapacity,
}

/// One manual ban, as persisted in `banlist.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BanEntry {
    pub ip: IpAddr,
    pub ban_until: u64,
    pub reason: String,
}

pub struct PeerManager {
    config: PeerManagerConfig,
    peers: DashMap<PeerId, Arc<Peer>>,
    next_peer_id: AtomicU64,
    /// Serializes count-check + evict + insert.
    admission: Mutex<()>,
    /// Nonces of our in-flight outbound VERSIONs (self-connection check).
    pending_nonces: Mutex<HashSet<u64>>,
    /// ip -> unix time the discouragement lapses. Never persisted.
    discouraged: Mutex<HashMap<IpAddr, u64>>,
    /// Manual bans; persisted with mode 0600.
    banned: Mutex<HashMap<IpAddr, BanEntry>>,
    hub: Arc<NotificationHub>,
}

impl PeerManager {
    pub fn new(config: PeerManagerConfig, hub: Arc<NotificationHub>) -> Self {
        PeerManager {
            config,
            peers: DashMap::new(),
            next_peer_id: AtomicU64::new(1),
            admission: Mutex::new(()),
            pending_nonces: Mutex::new(HashSet::new()),
            discouraged: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashMap::new()),
            hub,
        }
    }

    pub fn next_id(&self) -> PeerId {
        self.next_peer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.get(&id).map(|p| p.clone())
    }

    pub fn inbound_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.conn_type == ConnectionType::Inbound)
            .count()
    }

    /// Full-relay and block-relay outbound slots; feelers are transient and
    /// not counted against the cap.
    pub fn outbound_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.conn_type.is_outbound() && p.conn_type != ConnectionType::Feeler)
            .count()
    }

    pub fn has_outbound_slot(&self) -> bool {
        self.outbound_count() < self.config.max_outbound
    }

    /// Admits a connection. For inbound peers at the cap, eviction runs
    /// under the same lock acquisition; if nothing is evictable the new
    /// connection is refused.
    pub fn try_add_peer(&self, peer: Arc<Peer>, now: u64) -> Result<(), AdmissionError> {
        if self.is_blocked(&peer.addr.ip(), now) && !peer.permissions.no_ban {
            return Err(AdmissionError::Banned);
        }
        let _admission = self.admission.lock();
        match peer.conn_type {
            ConnectionType::Inbound => {
                if self.inbound_count() >= self.config.max_inbound && !self.evict_inbound() {
                    return Err(AdmissionError::AtCapacity);
                }
            }
            ConnectionType::Feeler => {}
            _ => {
                if self.outbound_count() >= self.config.max_outbound {
                    return Err(AdmissionError::AtCapacity);
                }
            }
        }
        debug!(target: "p2p", peer = peer.id, addr = %peer.addr, kind = ?peer.conn_type, "peer admitted");
        self.peers.insert(peer.id, peer);
        Ok(())
    }

    /// Inbound eviction: skip protected peers (manual/no-ban and the newest
    /// [`EVICTION_PROTECT_NEWEST`]), then drop the worst-behaved, oldest
    /// connection. Returns whether a slot was freed.
    fn evict_inbound(&self) -> bool {
        let mut candidates: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .filter(|p| p.conn_type == ConnectionType::Inbound)
            .filter(|p| !p.permissions.no_ban && !p.permissions.manual)
            .map(|p| p.clone())
            .collect();
        // Newest first, so the protected prefix is easy to cut off.
        candidates.sort_by_key(|p| std::cmp::Reverse(p.stats.connected_at));
        if candidates.len() <= EVICTION_PROTECT_NEWEST {
            return false;
        }
        let victim = candidates[EVICTION_PROTECT_NEWEST..]
            .iter()
            .max_by_key(|p| {
                (
                    p.misbehavior.load(Ordering::Relaxed),
                    std::cmp::Reverse(p.stats.connected_at),
                )
            })
            .cloned();
        match victim {
            Some(peer) => {
                info!(target: "p2p", peer = peer.id, addr = %peer.addr, "evicting inbound peer");
                peer.start_disconnect();
                self.peers.remove(&peer.id);
                true
            }
            None => false,
        }
    }

    /// Final removal, once the I/O tasks have reported the disconnect.
    pub fn remove_peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        let (_, peer) = self.peers.remove(&id)?;
        self.hub.publish(Event::PeerDisconnected { peer_id: id });
        Some(peer)
    }

    pub fn for_each<F: FnMut(&Arc<Peer>)>(&self, mut f: F) {
        for entry in self.peers.iter() {
            f(entry.value());
        }
    }

    pub fn ready_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|p| p.is_ready())
            .map(|p| p.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // ---- self-connection nonces ----------------------------------------

    pub fn register_outbound_nonce(&self, nonce: u64) {
        self.pending_nonces.lock().insert(nonce);
    }

    pub fn release_outbound_nonce(&self, nonce: u64) {
        self.pending_nonces.lock().remove(&nonce);
    }

    /// True when an incoming VERSION nonce matches one of our own pending
    /// outbound connections — we dialed ourselves.
    pub fn is_self_connection(&self, nonce: u64) -> bool {
        self.pending_nonces.lock().contains(&nonce)
    }

    // ---- misbehavior ----------------------------------------------------

    /// Applies a penalty. Returns true when the peer crossed the threshold
    /// and should be disconnected (its address is discouraged).
    pub fn misbehaving(&self, id: PeerId, penalty: u32, reason: &str, now: u64) -> bool {
        let Some(peer) = self.get(id) else {
            return false;
        };
        if penalty == 0 {
            return false;
        }
        let score = peer.misbehavior.fetch_add(penalty, Ordering::Relaxed) + penalty;
        warn!(target: "p2p", peer = id, addr = %peer.addr, penalty, score, reason,
              "peer misbehaving");
        if score >= MISBEHAVIOR_THRESHOLD && !peer.permissions.no_ban {
            self.discouraged
                .lock()
                .insert(peer.addr.ip(), now + DISCOURAGEMENT_SECS);
            return true;
        }
        false
    }

    /// The penalty table. Retryable outcomes cost nothing.
    pub fn penalty_for(error: &ValidationError) -> u32 {
        use ValidationError::*;
        match error {
            BadPow | BadCommitment | InvalidHeader | TooManyUnconnecting | TooManyOrphans => 100,
            BadDiffBits | TimeTooOld | TimeTooNew | BadVersion | BadGenesis | BadPrevBlock
            | NetworkExpired | InvalidDifficulty => 100,
            OversizedMessage | NonContinuousHeaders | EpochThrottled => 20,
            LowWorkHeaders => 10,
            Orphan | OrphanPoolFull | Stalled => 0,
            Internal(_) => 0,
        }
    }

    // ---- bans & discouragement -----------------------------------------

    pub fn is_blocked(&self, ip: &IpAddr, now: u64) -> bool {
        {
            let mut discouraged = self.discouraged.lock();
            if let Some(until) = discouraged.get(ip).copied() {
                if until > now {
                    return true;
                }
                discouraged.remove(ip);
            }
        }
        let mut banned = self.banned.lock();
        if let Some(entry) = banned.get(ip) {
            if entry.ban_until > now {
                return true;
            }
            banned.remove(ip);
        }
        false
    }

    pub fn set_ban(&self, ip: IpAddr, ban_until: u64, reason: String) {
        info!(target: "p2p", %ip, ban_until, "address banned");
        self.banned.lock().insert(
            ip,
            BanEntry {
                ip,
                ban_until,
                reason,
            },
        );
        // Disconnect anything already connected from there.
        self.for_each(|peer| {
            if peer.addr.ip() == ip && !peer.permissions.no_ban {
                peer.start_disconnect();
            }
        });
    }

    pub fn remove_ban(&self, ip: &IpAddr) -> bool {
        self.banned.lock().remove(ip).is_some()
    }

    pub fn clear_bans(&self) {
        self.banned.lock().clear();
    }

    pub fn list_bans(&self) -> Vec<BanEntry> {
        let mut entries: Vec<BanEntry> = self.banned.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.ip.to_string());
        entries
    }

    pub fn save_banlist(&self, path: &Path) -> std::io::Result<()> {
        let entries = self.list_bans();
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        fs::write(path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn load_banlist(&self, path: &Path, now: u64) -> std::io::Result<usize> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let entries: Vec<BanEntry> = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut banned = self.banned.lock();
        let mut loaded = 0;
        for entry in entries {
            if entry.ban_until > now {
                banned.insert(entry.ip, entry);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    // ---- anchors --------------------------------------------------------

    /// Up to two ready outbound block-relay peers, at most one per /16-style
    /// network group, for anchor persistence.
    pub fn anchor_candidates(&self) -> Vec<std::net::SocketAddr> {
        let mut groups: HashSet<Vec<u8>> = HashSet::new();
        let mut out = Vec::new();
        for peer in self.ready_peers() {
            if peer.conn_type != ConnectionType::BlockRelayOnly {
                continue;
            }
            let group = net_group(&peer.addr.ip());
            if !groups.insert(group) {
                continue;
            }
            out.push(peer.addr);
            if out.len() == 2 {
                break;
            }
        }
        out
    }
}

/// Network group key: /16 for IPv4, /32 for IPv6.
pub fn net_group(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets()[..2].to_vec(),
        IpAddr::V6(v6) => v6.octets()[..4].to_vec(),
    }
}
