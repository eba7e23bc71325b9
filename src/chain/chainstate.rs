//! The chainstate manager: single-track header acceptance and best-chain
//! activation.
//!
//! Every header — from the network, the local miner, or a snapshot replay —
//! goes through [`Chainstate::accept_header`]. All consensus state (store,
//! candidate set, orphan pool, failed set) sits behind one non-re-entrant
//! lock held for the whole of each public operation; orphan unlocking is
//! iterative, so nothing ever re-enters the lock.
//!
//! Notification delivery is synchronous and happens under the lock:
//! subscribers must not call back into the chainstate.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::BlockHeader;
use crate::chain::index::{BlockStatus, NodeId};
use crate::chain::orphans::OrphanPool;
use crate::chain::selector::CandidateSet;
use crate::chain::store::{BlockStore, StoreError};
use crate::consensus::asert::{self, AsertAnchor};
use crate::consensus::pow::RandomxEngine;
use crate::consensus::validation::{
    self, ContextualInfo, ValidationError, ValidationResult,
};
use crate::consensus::ConsensusParams;
use crate::notifications::{Event, NotificationHub};
use crate::primitives::{Hash160, Hash256, U256};
use crate::time::Clock;

/// Tunables that are policy, not consensus.
#[derive(Debug, Clone)]
pub struct ChainstateConfig {
    /// Reorganizations at least this deep are refused and reported.
    pub suspicious_reorg_depth: u64,
    /// Off-chain branches this far behind the tip are pruned from the index.
    pub stale_branch_depth: u64,
}

impl Default for ChainstateConfig {
    fn default() -> Self {
        ChainstateConfig {
            suspicious_reorg_depth: 100,
            stale_branch_depth: 50_000,
        }
    }
}

/// Failure of a best-chain activation or invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivateError {
    #[error("block is not indexed")]
    UnknownBlock,
    #[error("candidate shares no ancestor with the active chain")]
    NoCommonAncestor,
    #[error("reorg depth {depth} refused (limit {allowed})")]
    SuspiciousReorg { depth: u64, allowed: u64 },
    #[error("connecting the candidate chain failed")]
    ConnectFailed,
    #[error("internal consistency violation: {0}")]
    Internal(String),
}

/// What `accept_header` hands back on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedHeader {
    pub hash: Hash256,
    pub height: u64,
    pub chain_work: U256,
    /// False when the header was already indexed.
    pub is_new: bool,
}

/// A leaf summary for `getchaintips`-style queries.
#[derive(Debug, Clone)]
pub struct ChainTipInfo {
    pub hash: Hash256,
    pub height: u64,
    pub branch_length: u64,
    pub status: &'static str,
}

struct Inner {
    store: BlockStore,
    candidates: CandidateSet,
    orphans: OrphanPool,
    /// Hashes that failed validation outright; duplicates die fast here.
    failed: HashSet<Hash256>,
    best_header: Option<NodeId>,
}

pub struct Chainstate {
    params: ConsensusParams,
    config: ChainstateConfig,
    engine: Arc<RandomxEngine>,
    hub: Arc<NotificationHub>,
    clock: Arc<Clock>,
    /// Latched true on the first transition out of initial sync.
    synced: AtomicBool,
    inner: Mutex<Inner>,
}

impl Chainstate {
    pub fn new(
        params: ConsensusParams,
        config: ChainstateConfig,
        engine: Arc<RandomxEngine>,
        hub: Arc<NotificationHub>,
        clock: Arc<Clock>,
    ) -> Self {
        Chainstate {
            params,
            config,
            engine,
            hub,
            clock,
            synced: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                store: BlockStore::new(),
                candidates: CandidateSet::new(),
                orphans: OrphanPool::new(),
                failed: HashSet::new(),
                best_header: None,
            }),
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// Installs the genesis header. This is the only path that accepts a
    /// null previous hash; [`Self::accept_header`] rejects genesis replays.
    pub fn initialize(&self) -> ValidationResult {
        let mut inner = self.inner.lock();
        if !inner.store.is_empty() {
            // Loaded from a snapshot; make sure the tip vector exists.
            if inner.store.tip().is_none() {
                let genesis = inner
                    .store
                    .lookup(&self.params.genesis_hash())
                    .ok_or_else(|| {
                        ValidationError::Internal("snapshot lacks the genesis block".into())
                    })?;
                inner.store.set_tip(genesis);
            }
            return Ok(());
        }
        let genesis = *self.params.genesis_header();
        let id = inner.store.add_to_index(&genesis, None);
        inner.store[id].status.insert(BlockStatus::VALID_TREE);
        inner.store.set_tip(id);
        let inner_ref = &mut *inner;
        inner_ref.candidates.try_add(&inner_ref.store, id);
        inner.best_header = Some(id);
        info!(target: "chain", genesis = %self.params.genesis_hash(), network = %self.params.network,
              "chainstate initialized");
        Ok(())
    }

    /// Accepts one header, then drains any orphans it (transitively)
    /// unlocks. Iterative by construction: a work queue of parent hashes
    /// bounds stack depth regardless of how long the cached chain is.
    pub fn accept_header(
        &self,
        header: BlockHeader,
        peer: Option<u64>,
    ) -> Result<AcceptedHeader, ValidationError> {
        let mut inner = self.inner.lock();
        let (id, is_new) = self.accept_one(&mut inner, header, peer)?;
        let accepted = AcceptedHeader {
            hash: inner.store[id].hash,
            height: inner.store[id].height,
            chain_work: inner.store[id].chain_work,
            is_new,
        };

        let mut queue: VecDeque<Hash256> = VecDeque::new();
        queue.push_back(accepted.hash);
        while let Some(parent_hash) = queue.pop_front() {
            for entry in inner.orphans.take_children(&parent_hash) {
                let orphan_hash = entry.header.hash();
                match self.accept_one(&mut inner, entry.header, entry.peer) {
                    Ok((_, true)) => queue.push_back(orphan_hash),
                    Ok((_, false)) => {}
                    Err(e) => {
                        debug!(target: "chain", hash = %orphan_hash, error = %e,
                               "cached orphan failed on unlock");
                    }
                }
            }
        }
        Ok(accepted)
    }

    /// One header through the acceptance pipeline. Holds the lock the caller
    /// already took; never recurses.
    fn accept_one(
        &self,
        inner: &mut Inner,
        header: BlockHeader,
        peer: Option<u64>,
    ) -> Result<(NodeId, bool), ValidationError> {
        let hash = header.hash();

        // 1. Duplicates: cheap exits for both the valid and the failed case.
        if inner.failed.contains(&hash) {
            return Err(ValidationError::InvalidHeader);
        }
        if let Some(existing) = inner.store.lookup(&hash) {
            if inner.store[existing].status.is_failed() {
                return Err(ValidationError::InvalidHeader);
            }
            return Ok((existing, false));
        }

        // 2. Context-free: bits must decode, commitment must pre-pass.
        let target = validation::decode_target(header.bits, &self.params)?;
        self.engine.check_commitment(&header, &target)?;

        // 3. Genesis never arrives over the accept path.
        if header.prev_hash.is_null() {
            return Err(ValidationError::BadGenesis);
        }

        // 4. Unknown parent: cache and report.
        let Some(parent) = inner.store.lookup(&header.prev_hash) else {
            inner.orphans.try_add(header, peer, self.clock.now())?;
            return Err(ValidationError::Orphan);
        };

        // 5. Descendants of invalid blocks are invalid.
        if inner.store[parent].status.is_failed() {
            inner.failed.insert(hash);
            return Err(ValidationError::BadPrevBlock);
        }

        // 6. Index it; height and work are fixed from here on.
        let id = inner.store.add_to_index(&header, Some(parent));

        // 7. Contextual rules against the parent and the adjusted clock.
        let contextual = self.required_bits(&inner.store, parent).and_then(|required| {
            let ctx = ContextualInfo {
                parent_height: inner.store[parent].height,
                parent_mtp: inner.store.median_time_past(parent),
                required_bits: required,
            };
            validation::contextual_check(
                header.time,
                header.bits,
                &ctx,
                self.clock.adjusted(),
                &self.params,
            )
        });
        if let Err(e) = contextual {
            self.reject_indexed(inner, id, hash, peer, &e);
            return Err(e);
        }

        // 8. Full RandomX verification, throttled per peer on new epochs.
        if let Err(e) = self
            .engine
            .check_full(&header, &target, peer, self.clock.now())
        {
            self.reject_indexed(inner, id, hash, peer, &e);
            return Err(e);
        }

        // 9–10. Fully valid in the tree; track best header and candidacy.
        inner.store[id].status.insert(BlockStatus::VALID_TREE);
        let work = inner.store[id].chain_work;
        let best_work = inner.best_header.map(|b| inner.store[b].chain_work);
        if best_work.map(|w| work > w).unwrap_or(true) {
            inner.best_header = Some(id);
        }
        inner.candidates.try_add(&inner.store, id);
        inner.candidates.remove(&inner.store, parent);

        debug!(target: "chain", %hash, height = inner.store[id].height, "header accepted");
        Ok((id, true))
    }

    /// Marks a freshly-indexed header failed and propagates to any (already
    /// known) descendants.
    fn reject_indexed(
        &self,
        inner: &mut Inner,
        id: NodeId,
        hash: Hash256,
        peer: Option<u64>,
        error: &ValidationError,
    ) {
        inner.store[id].status.insert(BlockStatus::FAILED_VALID);
        inner.failed.insert(hash);
        Self::propagate_failure(inner, id);
        self.hub.publish(Event::InvalidHeader {
            peer_id: peer,
            hash,
            reason: error.to_string(),
        });
        warn!(target: "chain", %hash, error = %error, "header rejected");
    }

    /// Breadth-first FAILED_CHILD propagation from a failed node.
    fn propagate_failure(inner: &mut Inner, from: NodeId) {
        let mut queue: VecDeque<NodeId> = inner.store[from].children.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if inner.store[id].status.is_failed() {
                continue;
            }
            inner.store[id].status.insert(BlockStatus::FAILED_CHILD);
            inner.candidates.remove(&inner.store, id);
            queue.extend(inner.store[id].children.iter().copied());
        }
        inner.candidates.remove(&inner.store, from);
    }

    /// Required difficulty for the block after `parent`: launch difficulty up
    /// to the anchor height, the exponential schedule beyond it.
    fn required_bits(&self, store: &BlockStore, parent: NodeId) -> ValidationResult<u32> {
        let next_height = store[parent].height + 1;
        if next_height <= self.params.asert_anchor_height {
            return Ok(self.params.pow_limit_bits);
        }
        let anchor_id = store
            .get_ancestor(parent, self.params.asert_anchor_height)
            .ok_or(ValidationError::InvalidDifficulty)?;
        let anchor_node = &store[anchor_id];
        let prev_time = match anchor_node.parent {
            Some(p) => store[p].time,
            None => anchor_node.time,
        };
        let anchor = AsertAnchor {
            height: anchor_node.height,
            bits: anchor_node.bits,
            prev_time,
        };
        asert::next_required_bits(&anchor, store[parent].height, store[parent].time, &self.params)
    }

    /// Activates the most-work candidate chain.
    ///
    /// `pre_batch_tip` is the tip the caller observed before it started
    /// feeding headers; the suspicious-reorg depth is measured against it so
    /// incremental accepts cannot erode the check. `None` measures against
    /// the current tip.
    pub fn activate_best_chain(
        &self,
        pre_batch_tip: Option<Hash256>,
    ) -> Result<(), ActivateError> {
        let mut inner = self.inner.lock();
        self.activate_inner(&mut inner, pre_batch_tip)
    }

    fn activate_inner(
        &self,
        inner: &mut Inner,
        pre_batch_tip: Option<Hash256>,
    ) -> Result<(), ActivateError> {
        let Some(target) = inner.candidates.find_most_work() else {
            return Ok(());
        };
        let Some(tip) = inner.store.tip() else {
            return Ok(());
        };
        if target == tip || inner.store[target].chain_work <= inner.store[tip].chain_work {
            return Ok(());
        }

        let fork = inner
            .store
            .last_common_ancestor(tip, target)
            .ok_or(ActivateError::NoCommonAncestor)?;

        // Depth is measured from the tip as it stood before this batch of
        // headers started arriving.
        let baseline = pre_batch_tip
            .and_then(|h| inner.store.lookup(&h))
            .unwrap_or(tip);
        let depth_fork = inner
            .store
            .last_common_ancestor(baseline, target)
            .ok_or(ActivateError::NoCommonAncestor)?;
        let reorg_depth = inner.store[baseline]
            .height
            .saturating_sub(inner.store[depth_fork].height);
        if reorg_depth >= self.config.suspicious_reorg_depth {
            self.hub.publish(Event::SuspiciousReorg {
                depth: reorg_depth,
                allowed_max: self.config.suspicious_reorg_depth,
            });
            warn!(target: "chain", depth = reorg_depth, limit = self.config.suspicious_reorg_depth,
                  "refusing suspiciously deep reorg");
            return Err(ActivateError::SuspiciousReorg {
                depth: reorg_depth,
                allowed: self.config.suspicious_reorg_depth,
            });
        }

        let old_tip_hash = inner.store[tip].hash;

        // Disconnect tip -> fork.
        let mut disconnected: Vec<NodeId> = Vec::new();
        while inner.store.tip() != Some(fork) {
            let popped = inner
                .store
                .pop_tip()
                .ok_or_else(|| ActivateError::Internal("walked past genesis".into()))?;
            disconnected.push(popped);
            self.hub.publish(Event::BlockDisconnected {
                hash: inner.store[popped].hash,
                height: inner.store[popped].height,
            });
        }

        // Connect fork -> target, in chain order.
        let mut path: Vec<NodeId> = Vec::new();
        let mut cursor = target;
        while cursor != fork {
            path.push(cursor);
            cursor = inner.store[cursor]
                .parent
                .ok_or_else(|| ActivateError::Internal("candidate detached from fork".into()))?;
        }
        path.reverse();

        let mut connected: Vec<NodeId> = Vec::new();
        for id in path {
            if inner.store[id].status.is_failed() {
                // Rewind everything and restore the original tip.
                for undo in connected.iter().rev() {
                    inner.store.pop_tip();
                    self.hub.publish(Event::BlockDisconnected {
                        hash: inner.store[*undo].hash,
                        height: inner.store[*undo].height,
                    });
                }
                for redo in disconnected.iter().rev() {
                    inner.store.push_tip(*redo);
                    self.hub.publish(Event::BlockConnected {
                        hash: inner.store[*redo].hash,
                        height: inner.store[*redo].height,
                    });
                }
                warn!(target: "chain", "connect failed, original tip restored");
                return Err(ActivateError::ConnectFailed);
            }
            inner.store.push_tip(id);
            connected.push(id);
            self.hub.publish(Event::BlockConnected {
                hash: inner.store[id].hash,
                height: inner.store[id].height,
            });
        }

        let new_tip = inner.store[target].hash;
        let new_height = inner.store[target].height;
        self.hub.publish(Event::NewTip {
            hash: new_tip,
            height: new_height,
            work: inner.store[target].chain_work,
        });
        if !disconnected.is_empty() {
            let fork_height = inner.store[fork].height;
            info!(target: "chain", %old_tip_hash, %new_tip, fork_height, depth = disconnected.len(),
                  "chain reorganized");
            self.hub.publish(Event::Reorg {
                old_tip: old_tip_hash,
                new_tip,
                fork_height,
            });
        } else {
            debug!(target: "chain", %new_tip, height = new_height, "tip advanced");
        }
        inner.candidates.prune(&inner.store, target);
        Ok(())
    }

    /// Manually invalidates a block: walks the active chain back until the
    /// block is off it, marks it and all descendants failed, and re-activates
    /// the best remaining chain. The lock is held for the whole operation —
    /// no other thread can observe the intermediate states.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), ActivateError> {
        let mut inner = self.inner.lock();
        let id = inner.store.lookup(hash).ok_or(ActivateError::UnknownBlock)?;

        inner.store[id].status.insert(BlockStatus::FAILED_VALID);
        inner.failed.insert(*hash);
        Self::propagate_failure(&mut inner, id);

        while inner.store.is_active(id) {
            let popped = inner
                .store
                .pop_tip()
                .ok_or_else(|| ActivateError::Internal("cannot invalidate genesis".into()))?;
            self.hub.publish(Event::BlockDisconnected {
                hash: inner.store[popped].hash,
                height: inner.store[popped].height,
            });
        }

        // The surviving tip becomes a candidate again.
        if let Some(tip) = inner.store.tip() {
            let inner_ref = &mut *inner;
            inner_ref.candidates.try_add(&inner_ref.store, tip);
            let best_is_failed = inner
                .best_header
                .map(|b| inner.store[b].status.is_failed())
                .unwrap_or(true);
            if best_is_failed {
                inner.best_header = Some(tip);
            }
        }
        info!(target: "chain", %hash, "block invalidated");
        self.activate_inner(&mut inner, None)
    }

    /// True until the tip is both recent and carries the minimum work; the
    /// first "synced" observation latches for the life of the process.
    pub fn is_initial_block_download(&self) -> bool {
        if self.synced.load(Ordering::Relaxed) {
            return false;
        }
        let inner = self.inner.lock();
        let Some(tip) = inner.store.tip() else {
            return true;
        };
        let node = &inner.store[tip];
        let recent = (node.time as u64).saturating_add(3600) > self.clock.adjusted();
        if recent && node.chain_work >= self.params.minimum_chain_work {
            drop(inner);
            self.synced.store(true, Ordering::Relaxed);
            info!(target: "chain", "initial header sync complete");
            return false;
        }
        true
    }

    // ---- housekeeping ---------------------------------------------------

    /// Periodic upkeep: orphan expiry and stale-branch pruning.
    pub fn maintenance(&self) {
        let mut inner = self.inner.lock();
        let expired = inner.orphans.expire(self.clock.now());
        let pruned = self.prune_stale_branches(&mut inner);
        if expired + pruned > 0 {
            debug!(target: "chain", expired, pruned, "chainstate maintenance");
        }
    }

    /// Removes leaves of branches that are failed or hopelessly far behind
    /// the active tip, repeating until no prunable leaf remains.
    fn prune_stale_branches(&self, inner: &mut Inner) -> usize {
        let Some(tip) = inner.store.tip() else {
            return 0;
        };
        let tip_height = inner.store[tip].height;
        let mut removed = 0;
        loop {
            let victims: Vec<NodeId> = inner
                .store
                .iter()
                .filter(|(id, node)| {
                    node.children.is_empty()
                        && !inner.store.is_active(*id)
                        && (node.status.is_failed()
                            || tip_height.saturating_sub(node.height)
                                >= self.config.stale_branch_depth)
                })
                .map(|(id, _)| id)
                .collect();
            if victims.is_empty() {
                break;
            }
            for id in victims {
                inner.candidates.remove(&inner.store, id);
                if inner.best_header == Some(id) {
                    inner.best_header = Some(tip);
                }
                inner.store.remove_node(id);
                removed += 1;
            }
        }
        removed
    }

    /// Forgets per-peer throttle and orphan state when a peer goes away.
    pub fn on_peer_disconnected(&self, peer: u64) {
        let mut inner = self.inner.lock();
        inner.orphans.remove_peer(peer);
        self.engine.forget_peer(peer);
    }

    // ---- persistence ----------------------------------------------------

    pub fn load_snapshot(&self, path: &Path) -> Result<bool, StoreError> {
        let Some(store) = BlockStore::load(path, &self.params)? else {
            return Ok(false);
        };
        let mut inner = self.inner.lock();
        let mut failed = HashSet::new();
        let mut candidates = CandidateSet::new();
        let mut best: Option<NodeId> = None;
        for (id, node) in store.iter() {
            if node.status.has(BlockStatus::FAILED_VALID) {
                failed.insert(node.hash);
            }
            if !node.status.is_failed() {
                let better = best.map(|b| node.chain_work > store[b].chain_work).unwrap_or(true);
                if better {
                    best = Some(id);
                }
            }
        }
        for (id, node) in store.iter() {
            if !node.status.is_failed() {
                candidates.try_add(&store, id);
            }
        }
        inner.store = store;
        inner.candidates = candidates;
        inner.failed = failed;
        inner.best_header = best;
        Ok(true)
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let inner = self.inner.lock();
        inner.store.save(path, self.params.genesis_hash())
    }

    // ---- queries --------------------------------------------------------

    pub fn tip(&self) -> Option<AcceptedHeader> {
        let inner = self.inner.lock();
        inner.store.tip().map(|id| AcceptedHeader {
            hash: inner.store[id].hash,
            height: inner.store[id].height,
            chain_work: inner.store[id].chain_work,
            is_new: false,
        })
    }

    pub fn block_count(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .store
            .tip()
            .map(|id| inner.store[id].height)
            .unwrap_or(0)
    }

    pub fn block_hash_at(&self, height: u64) -> Option<Hash256> {
        let inner = self.inner.lock();
        inner.store.at_height(height).map(|id| inner.store[id].hash)
    }

    /// Header plus index metadata, for the RPC surface.
    pub fn header_info(&self, hash: &Hash256) -> Option<(BlockHeader, u64, U256, bool)> {
        let inner = self.inner.lock();
        let id = inner.store.lookup(hash)?;
        let header = inner.store.header_of(id);
        let node = &inner.store[id];
        Some((header, node.height, node.chain_work, inner.store.is_active(id)))
    }

    /// All known leaves, active tip first.
    pub fn chain_tips(&self) -> Vec<ChainTipInfo> {
        let inner = self.inner.lock();
        let mut tips = Vec::new();
        for (id, node) in inner.store.iter() {
            let has_live_child = node
                .children
                .iter()
                .any(|c| inner.store.get(*c).is_some());
            if has_live_child {
                continue;
            }
            let active = inner.store.is_active(id);
            let status = if active {
                "active"
            } else if node.status.has(BlockStatus::FAILED_VALID) {
                "invalid"
            } else if node.status.has(BlockStatus::FAILED_CHILD) {
                "invalid-ancestor"
            } else {
                "valid-headers"
            };
            let branch_length = match inner.store.last_common_ancestor(
                id,
                inner.store.tip().unwrap_or(id),
            ) {
                Some(fork) => node.height.saturating_sub(inner.store[fork].height),
                None => node.height,
            };
            tips.push(ChainTipInfo {
                hash: node.hash,
                height: node.height,
                branch_length,
                status,
            });
        }
        tips.sort_by_key(|t| (t.status != "active", std::cmp::Reverse(t.height)));
        tips
    }

    /// Estimated network hash rate over the last `blocks` blocks.
    pub fn network_hashps(&self, blocks: u64) -> f64 {
        let inner = self.inner.lock();
        let Some(tip) = inner.store.tip() else {
            return 0.0;
        };
        let tip_node = &inner.store[tip];
        let span = blocks.min(tip_node.height).max(1);
        let Some(past) = inner.store.at_height(tip_node.height - span) else {
            return 0.0;
        };
        let past_node = &inner.store[past];
        let work = tip_node.chain_work.saturating_sub(past_node.chain_work);
        let elapsed = tip_node.time.saturating_sub(past_node.time).max(1);
        work.as_f64() / elapsed as f64
    }

    /// Locator from the active tip, for GETHEADERS.
    pub fn tip_locator(&self) -> Vec<Hash256> {
        let inner = self.inner.lock();
        match inner.store.tip() {
            Some(tip) => inner.store.locator(tip),
            None => Vec::new(),
        }
    }

    /// Headers after the locator's fork point, up to `max`, for serving
    /// GETHEADERS. The stop hash cuts the walk short when present.
    pub fn headers_after_locator(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
        max: usize,
    ) -> Vec<BlockHeader> {
        let inner = self.inner.lock();
        let Some(tip) = inner.store.tip() else {
            return Vec::new();
        };
        // First locator entry we know and have active gives the fork point;
        // with no usable locator, serve everything after genesis.
        let mut start_height = 1;
        for hash in locator {
            if let Some(id) = inner.store.lookup(hash) {
                if inner.store.is_active(id) {
                    start_height = inner.store[id].height + 1;
                    break;
                }
            }
        }
        let mut out = Vec::new();
        let tip_height = inner.store[tip].height;
        let mut height = start_height;
        while height <= tip_height && out.len() < max {
            let Some(id) = inner.store.at_height(height) else {
                break;
            };
            out.push(inner.store.header_of(id));
            if inner.store[id].hash == *stop {
                break;
            }
            height += 1;
        }
        out
    }

    /// The minimum cumulative work a headers chain must reach before this
    /// node spends memory on it.
    pub fn anti_dos_threshold(&self) -> U256 {
        let in_ibd = self.is_initial_block_download();
        let inner = self.inner.lock();
        let tip = inner
            .store
            .tip()
            .map(|id| (inner.store[id].chain_work, inner.store[id].bits));
        validation::anti_dos_work_threshold(in_ibd, tip, &self.params)
    }

    /// Template for the local miner: parent, schedule difficulty, and a
    /// timestamp that satisfies the contextual rules.
    pub fn build_block_template(&self, miner: Hash160) -> ValidationResult<BlockHeader> {
        let inner = self.inner.lock();
        let tip = inner
            .store
            .tip()
            .ok_or_else(|| ValidationError::Internal("chainstate not initialized".into()))?;
        let bits = self.required_bits(&inner.store, tip)?;
        let mtp = inner.store.median_time_past(tip);
        let time = (self.clock.adjusted() as u32).max(mtp + 1);
        Ok(BlockHeader {
            version: 1,
            prev_hash: inner.store[tip].hash,
            miner_address: miner,
            time,
            bits,
            nonce: 0,
            randomx_hash: Hash256::ZERO,
        })
    }

    pub fn orphan_count(&self) -> usize {
        self.inner.lock().orphans.len()
    }

    pub fn index_size(&self) -> usize {
        self.inner.lock().store.len()
    }

    pub fn best_header_work(&self) -> U256 {
        let inner = self.inner.lock();
        inner
            .best_header
            .map(|id| inner.store[id].chain_work)
            .unwrap_or(U256::ZERO)
    }
}
