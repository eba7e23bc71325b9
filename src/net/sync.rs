//! Header synchronization and block announcement.
//!
//! One sync peer at a time. Batches are pre-filtered (continuity, bits,
//! commitment, cumulative work) before any header touches the chainstate,
//! and the tip observed *before* a batch is fed into activation so the
//! suspicious-reorg check cannot be eroded by incremental accepts. A silent
//! sync peer is dropped on a stall timer and another is selected.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::block::BlockHeader;
use crate::chain::Chainstate;
use crate::consensus::validation::{self, ValidationError};
use crate::net::message::{InvItem, Message, INV_BLOCK, PROTOCOL_VERSION};
use crate::net::peer::{Peer, PeerId};
use crate::net::peer_manager::PeerManager;
use crate::net::wire::MAX_HEADERS_RESULTS;
use crate::notifications::{Event, NotificationHub};
use crate::primitives::{Hash256, U256};
use crate::time::Clock;

/// No headers from the sync peer for this long means it is stalling us.
pub const SYNC_STALL_TIMEOUT_SECS: u64 = 60;

/// GETHEADERS token bucket: capacity and per-minute refill.
const GETHEADERS_BUCKET: f64 = 10.0;
const GETHEADERS_PER_SEC: f64 = 10.0 / 60.0;

/// Identical GETHEADERS inside this window are dropped silently.
const DUPLICATE_REQUEST_WINDOW_SECS: u64 = 30;

/// Unconnecting-headers deliveries tolerated before the peer is scored off.
const MAX_UNCONNECTING_HEADERS: u32 = 10;

/// Decay applied to the unconnecting counter per connecting delivery. Never
/// a blanket reset: an attacker cannot launder the counter with one good
/// header.
const UNCONNECTING_DECAY: u32 = 2;

struct RequestBudget {
    tokens: f64,
    last_refill: u64,
    last_fingerprint: Option<(u64, u64)>,
}

struct SyncState {
    sync_peer: Option<PeerId>,
    last_headers_at: u64,
    budgets: HashMap<PeerId, RequestBudget>,
}

pub struct SyncManager {
    chain: Arc<Chainstate>,
    peers: Arc<PeerManager>,
    clock: Arc<Clock>,
    hub: Arc<NotificationHub>,
    state: Mutex<SyncState>,
}

impl SyncManager {
    pub fn new(
        chain: Arc<Chainstate>,
        peers: Arc<PeerManager>,
        clock: Arc<Clock>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        SyncManager {
            chain,
            peers,
            clock,
            hub,
            state: Mutex::new(SyncState {
                sync_peer: None,
                last_headers_at: 0,
                budgets: HashMap::new(),
            }),
        }
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        self.state.lock().sync_peer
    }

    /// Picks a sync peer if none is active: the first ready outbound peer
    /// that advertises more chain than we have.
    pub fn maybe_start_sync(&self) {
        let mut state = self.state.lock();
        if let Some(current) = state.sync_peer {
            if self.peers.get(current).map(|p| !p.is_disconnecting()).unwrap_or(false) {
                return;
            }
            state.sync_peer = None;
        }
        let local_height = self.chain.block_count() as i64;
        let candidate = self
            .peers
            .ready_peers()
            .into_iter()
            .filter(|p| {
                p.conn_type.is_outbound() && p.conn_type != crate::net::peer::ConnectionType::Feeler
            })
            .find(|p| p.start_height().map(|h| h as i64 > local_height).unwrap_or(false));
        let Some(peer) = candidate else {
            return;
        };
        info!(target: "sync", peer = peer.id, addr = %peer.addr, "selected header sync peer");
        state.sync_peer = Some(peer.id);
        state.last_headers_at = self.clock.now();
        drop(state);
        self.request_headers(&peer);
    }

    fn request_headers(&self, peer: &Arc<Peer>) {
        let locator = self.chain.tip_locator();
        debug!(target: "sync", peer = peer.id, locator_len = locator.len(), "requesting headers");
        peer.send(Message::GetHeaders {
            version: PROTOCOL_VERSION,
            locator,
            stop: Hash256::ZERO,
        });
    }

    /// A HEADERS batch from `peer`. Returns the number of newly accepted
    /// headers (tests use this).
    pub fn handle_headers(&self, peer_id: PeerId, headers: Vec<BlockHeader>) -> usize {
        let Some(peer) = self.peers.get(peer_id) else {
            return 0;
        };
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            if state.sync_peer == Some(peer_id) {
                state.last_headers_at = now;
            }
        }
        if headers.is_empty() {
            debug!(target: "sync", peer = peer_id, "peer has no more headers");
            return 0;
        }
        let batch_len = headers.len();

        // Batch pre-filters: nothing below touches the chainstate until the
        // whole batch looks sane.
        if let Err(e) = self.prefilter_batch(&peer, &headers) {
            self.score(&peer, &e);
            return 0;
        }

        // The reorg-depth baseline is the tip as it stood before this batch.
        let pre_batch_tip = self.chain.tip().map(|t| t.hash);

        let mut accepted = 0usize;
        for header in headers {
            match self.chain.accept_header(header, Some(peer_id)) {
                Ok(info) => {
                    if info.is_new {
                        accepted += 1;
                    }
                    decay_unconnecting(&peer);
                }
                Err(ValidationError::Orphan) => {
                    // The batch did not connect to anything we have. Count
                    // it and re-negotiate with a fresh locator.
                    let strikes = peer
                        .unconnecting_headers
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                        + 1;
                    debug!(target: "sync", peer = peer_id, strikes, "unconnecting headers");
                    if strikes >= MAX_UNCONNECTING_HEADERS {
                        self.score(&peer, &ValidationError::TooManyUnconnecting);
                    } else {
                        self.request_headers(&peer);
                    }
                    break;
                }
                Err(e) => {
                    // Orphan-pool overflow or a hard failure: short-circuit
                    // the batch and let the penalty table decide.
                    self.score(&peer, &e);
                    break;
                }
            }
        }

        if accepted > 0 {
            if let Err(e) = self.chain.activate_best_chain(pre_batch_tip) {
                warn!(target: "sync", peer = peer_id, error = %e, "activation failed");
            }
        }

        // Chase the next window when the peer filled this one.
        if batch_len == MAX_HEADERS_RESULTS && accepted > 0 {
            self.request_headers(&peer);
        }
        accepted
    }

    /// Continuity, decodable bits, commitment pass, and the anti-DoS work
    /// floor, all before acceptance.
    fn prefilter_batch(
        &self,
        peer: &Arc<Peer>,
        headers: &[BlockHeader],
    ) -> Result<(), ValidationError> {
        let params = self.chain.params();
        for window in headers.windows(2) {
            if window[1].prev_hash != window[0].hash() {
                return Err(ValidationError::NonContinuousHeaders);
            }
        }
        let mut batch_work = U256::ZERO;
        for header in headers {
            let target = validation::decode_target(header.bits, params)
                .map_err(|_| ValidationError::InvalidHeader)?;
            if header.commitment_hash(&header.randomx_hash).to_u256() >= target {
                return Err(ValidationError::InvalidHeader);
            }
            batch_work = batch_work.saturating_add(validation::block_proof(header.bits));
        }

        // Cumulative work of the chain this batch extends.
        let parent_work = self
            .chain
            .header_info(&headers[0].prev_hash)
            .map(|(_, _, work, _)| work)
            .unwrap_or(U256::ZERO);
        let total = parent_work.saturating_add(batch_work);
        if total < self.chain.anti_dos_threshold() {
            self.hub.publish(Event::LowWorkHeaders { peer_id: peer.id });
            return Err(ValidationError::LowWorkHeaders);
        }
        Ok(())
    }

    /// Serves GETHEADERS, behind a token bucket and duplicate suppression.
    pub fn handle_getheaders(&self, peer_id: PeerId, locator: &[Hash256], stop: &Hash256) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        let now = self.clock.now();
        if !self.admit_getheaders(peer_id, locator, stop, now) {
            debug!(target: "sync", peer = peer_id, "getheaders dropped (rate limit)");
            return;
        }
        let headers = self
            .chain
            .headers_after_locator(locator, stop, MAX_HEADERS_RESULTS);
        debug!(target: "sync", peer = peer_id, count = headers.len(), "serving headers");
        peer.send(Message::Headers(headers));
    }

    fn admit_getheaders(
        &self,
        peer_id: PeerId,
        locator: &[Hash256],
        stop: &Hash256,
        now: u64,
    ) -> bool {
        let mut state = self.state.lock();
        let budget = state.budgets.entry(peer_id).or_insert(RequestBudget {
            tokens: GETHEADERS_BUCKET,
            last_refill: now,
            last_fingerprint: None,
        });

        // Identical request inside the window: silent drop.
        let fingerprint = fingerprint_request(locator, stop);
        if let Some((fp, at)) = budget.last_fingerprint {
            if fp == fingerprint && now.saturating_sub(at) < DUPLICATE_REQUEST_WINDOW_SECS {
                return false;
            }
        }

        let elapsed = now.saturating_sub(budget.last_refill) as f64;
        budget.tokens = (budget.tokens + elapsed * GETHEADERS_PER_SEC).min(GETHEADERS_BUCKET);
        budget.last_refill = now;
        if budget.tokens < 1.0 {
            return false;
        }
        budget.tokens -= 1.0;
        budget.last_fingerprint = Some((fingerprint, now));
        true
    }

    /// INV-driven announcement: an unknown block hash triggers a header
    /// request from the announcer.
    pub fn handle_inv(&self, peer_id: PeerId, items: &[InvItem]) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        let unknown = items
            .iter()
            .filter(|i| i.kind == INV_BLOCK)
            .any(|i| self.chain.header_info(&i.hash).is_none());
        if unknown {
            self.request_headers(&peer);
        }
    }

    /// Announces a new tip to every ready peer, once per peer per hash.
    /// `sendheaders` peers get the header pushed; the rest get an INV.
    pub fn announce_tip(&self, hash: Hash256) {
        let Some((header, _, _, _)) = self.chain.header_info(&hash) else {
            return;
        };
        for peer in self.peers.ready_peers() {
            if !peer.note_announced(&hash) {
                continue;
            }
            if peer.wants_headers_push() {
                peer.send(Message::Headers(vec![header]));
            } else {
                peer.send(Message::Inv(vec![InvItem {
                    kind: INV_BLOCK,
                    hash,
                }]));
            }
        }
    }

    /// Stall detection: a sync peer that has sent nothing inside the window
    /// is disconnected and replaced.
    pub fn check_stall(&self) {
        let now = self.clock.now();
        let stalled = {
            let mut state = self.state.lock();
            match state.sync_peer {
                Some(peer_id)
                    if now.saturating_sub(state.last_headers_at) > SYNC_STALL_TIMEOUT_SECS =>
                {
                    state.sync_peer = None;
                    Some(peer_id)
                }
                _ => None,
            }
        };
        if let Some(peer_id) = stalled {
            if let Some(peer) = self.peers.get(peer_id) {
                warn!(target: "sync", peer = peer_id, addr = %peer.addr, "header sync stalled, rotating peer");
                peer.start_disconnect();
            }
            self.maybe_start_sync();
        }
    }

    pub fn on_peer_disconnected(&self, peer_id: PeerId) {
        let mut state = self.state.lock();
        if state.sync_peer == Some(peer_id) {
            state.sync_peer = None;
        }
        state.budgets.remove(&peer_id);
    }

    /// Translates a failure into a penalty, disconnecting at the threshold.
    fn score(&self, peer: &Arc<Peer>, error: &ValidationError) {
        let penalty = PeerManager::penalty_for(error);
        if penalty == 0 {
            return;
        }
        if self
            .peers
            .misbehaving(peer.id, penalty, &error.to_string(), self.clock.now())
        {
            peer.start_disconnect();
        }
    }
}

fn decay_unconnecting(peer: &Arc<Peer>) {
    let _ = peer.unconnecting_headers.fetch_update(
        std::sync::atomic::Ordering::Relaxed,
        std::sync::atomic::Ordering::Relaxed,
        |v| Some(v.saturating_sub(UNCONNECTING_DECAY)),
    );
}

/// Cheap structural fingerprint of a GETHEADERS request.
fn fingerprint_request(locator: &[Hash256], stop: &Hash256) -> u64 {
    let mut acc: u64 = locator.len() as u64;
    if let Some(first) = locator.first() {
        let b = first.as_bytes();
        acc = acc
            .wrapping_mul(0x100000001b3)
            .wrapping_add(u64::from_le_bytes(b[..8].try_into().expect("fixed slice")));
    }
    let s = stop.as_bytes();
    acc.wrapping_mul(0x100000001b3)
        .wrapping_add(u64::from_le_bytes(s[..8].try_into().expect("fixed slice")))
}
