//! The block store: owner of every block-index node and of the active chain.
//!
//! Nodes sit in an arena of stable slots; the hash map and all links carry
//! [`NodeId`]s into it. The active chain is a dense vector indexed by
//! height. Persistence is a JSON snapshot whose genesis hash is verified
//! before a single node is inserted.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::ops::{Index, IndexMut};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::BlockHeader;
use crate::chain::index::{BlockIndexNode, BlockStatus, NodeId};
use crate::consensus::validation::block_proof;
use crate::consensus::ConsensusParams;
use crate::primitives::{Hash160, Hash256, U256};

/// Locator entries are capped; exponential stepping reaches genesis well
/// before this on any realistic chain.
pub const MAX_LOCATOR_SIZE: usize = 101;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot is for a different network (genesis mismatch)")]
    GenesisMismatch,
    #[error("snapshot corrupt: {0}")]
    Corrupt(String),
}

#[derive(Default, Debug)]
pub struct BlockStore {
    slots: Vec<Option<BlockIndexNode>>,
    free: Vec<u32>,
    by_hash: HashMap<Hash256, NodeId>,
    /// `active[h]` is the node at height `h` on the best chain.
    active: Vec<NodeId>,
}

impl BlockStore {
    pub fn new() -> Self {
        BlockStore::default()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&BlockIndexNode> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut BlockIndexNode> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Inserts a header under `parent`, computing height and cumulative work.
    /// Returns the existing id when the hash is already indexed.
    pub fn add_to_index(&mut self, header: &BlockHeader, parent: Option<NodeId>) -> NodeId {
        let hash = header.hash();
        if let Some(existing) = self.by_hash.get(&hash) {
            return *existing;
        }

        let proof = block_proof(header.bits);
        let (height, chain_work) = match parent {
            Some(pid) => {
                let p = &self[pid];
                (p.height + 1, p.chain_work.saturating_add(proof))
            }
            None => (0, proof),
        };

        let node = BlockIndexNode {
            hash,
            parent,
            children: Vec::new(),
            height,
            chain_work,
            status: BlockStatus::VALID_HEADER,
            version: header.version,
            miner_address: header.miner_address,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            randomx_hash: header.randomx_hash,
        };

        let id = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeId((self.slots.len() - 1) as u32)
            }
        };
        self.by_hash.insert(hash, id);
        if let Some(pid) = parent {
            self[pid].children.push(id);
        }
        id
    }

    /// Removes one node from the arena. The caller guarantees it is neither
    /// on the active chain nor referenced by surviving children.
    pub fn remove_node(&mut self, id: NodeId) {
        let Some(node) = self.slots.get_mut(id.0 as usize).and_then(Option::take) else {
            return;
        };
        self.by_hash.remove(&node.hash);
        if let Some(pid) = node.parent {
            if let Some(parent) = self.get_mut(pid) {
                parent.children.retain(|c| *c != id);
            }
        }
        self.free.push(id.0);
    }

    pub fn prev_hash_of(&self, id: NodeId) -> Hash256 {
        match self[id].parent {
            Some(pid) => self[pid].hash,
            None => Hash256::ZERO,
        }
    }

    pub fn header_of(&self, id: NodeId) -> BlockHeader {
        let prev = self.prev_hash_of(id);
        self[id].to_header(prev)
    }

    /// Iterate all live nodes.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BlockIndexNode)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|n| (NodeId(i as u32), n)))
    }

    // ---- active chain ---------------------------------------------------

    pub fn tip(&self) -> Option<NodeId> {
        self.active.last().copied()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn at_height(&self, height: u64) -> Option<NodeId> {
        self.active.get(height as usize).copied()
    }

    /// Membership by the dense-vector rule: `active[node.height] == node`.
    pub fn is_active(&self, id: NodeId) -> bool {
        let height = self[id].height;
        self.at_height(height) == Some(id)
    }

    /// Rebuilds the vector by walking parents back to genesis.
    pub fn set_tip(&mut self, tip: NodeId) {
        let mut chain = Vec::with_capacity(self[tip].height as usize + 1);
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self[id].parent;
        }
        chain.reverse();
        debug_assert_eq!(self[chain[0]].height, 0, "active chain must root at genesis");
        self.active = chain;
    }

    /// Extends the active chain by one block (the child of the current tip).
    pub fn push_tip(&mut self, id: NodeId) {
        debug_assert_eq!(self[id].parent, self.tip());
        self.active.push(id);
    }

    /// Drops the tip, returning it. Never pops genesis.
    pub fn pop_tip(&mut self) -> Option<NodeId> {
        if self.active.len() <= 1 {
            return None;
        }
        self.active.pop()
    }

    pub fn clear_active(&mut self) {
        self.active.clear();
    }

    // ---- tree walks -----------------------------------------------------

    /// Ancestor of `id` at `height`, following the active chain when
    /// possible and parent links otherwise.
    pub fn get_ancestor(&self, id: NodeId, height: u64) -> Option<NodeId> {
        let node_height = self[id].height;
        if height > node_height {
            return None;
        }
        if self.is_active(id) {
            return self.at_height(height);
        }
        let mut cursor = id;
        while self[cursor].height > height {
            cursor = self[cursor].parent?;
            // Once the walk crosses onto the active chain, jump directly.
            if self.is_active(cursor) {
                return self.at_height(height);
            }
        }
        Some(cursor)
    }

    /// Last common ancestor of two nodes; `None` only for disjoint trees.
    pub fn last_common_ancestor(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let (mut a, mut b) = (a, b);
        if self[a].height > self[b].height {
            a = self.get_ancestor(a, self[b].height)?;
        } else if self[b].height > self[a].height {
            b = self.get_ancestor(b, self[a].height)?;
        }
        while a != b {
            a = self[a].parent?;
            b = self[b].parent?;
        }
        Some(a)
    }

    /// Median time past of a node: median over the node and up to ten of its
    /// ancestors.
    pub fn median_time_past(&self, id: NodeId) -> u32 {
        let mut times = Vec::with_capacity(crate::consensus::params::MEDIAN_TIME_SPAN);
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            times.push(self[cur].time);
            if times.len() == crate::consensus::params::MEDIAN_TIME_SPAN {
                break;
            }
            cursor = self[cur].parent;
        }
        times.reverse();
        crate::consensus::validation::median_time_past(&times)
    }

    /// Block locator starting at `from`: dense for ten entries, then
    /// exponentially sparse, always terminating at genesis.
    pub fn locator(&self, from: NodeId) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let mut step: u64 = 1;
        let mut cursor = from;
        loop {
            hashes.push(self[cursor].hash);
            let height = self[cursor].height;
            if height == 0 || hashes.len() >= MAX_LOCATOR_SIZE {
                break;
            }
            if hashes.len() >= 10 {
                step = step.saturating_mul(2);
            }
            let next_height = height.saturating_sub(step);
            match self.get_ancestor(cursor, next_height) {
                Some(a) => cursor = a,
                None => break,
            }
        }
        // Genesis always anchors the locator when it is reachable.
        if let Some(genesis) = self.at_height(0).or_else(|| self.get_ancestor(from, 0)) {
            let genesis_hash = self[genesis].hash;
            if hashes.last() != Some(&genesis_hash) {
                if hashes.len() >= MAX_LOCATOR_SIZE {
                    hashes.pop();
                }
                hashes.push(genesis_hash);
            }
        }
        hashes
    }

    // ---- persistence ----------------------------------------------------

    pub fn save(&self, path: &Path, genesis_hash: Hash256) -> Result<(), StoreError> {
        let tip_hash = self.tip().map(|id| self[id].hash).unwrap_or(Hash256::ZERO);
        let mut blocks: Vec<SnapshotBlock> = self
            .iter()
            .map(|(id, node)| SnapshotBlock {
                hash: node.hash,
                height: node.height,
                chainwork: node.chain_work,
                version: node.version,
                prev_hash: self.prev_hash_of(id),
                miner_address: node.miner_address,
                time: node.time,
                bits: node.bits,
                nonce: node.nonce,
                hash_randomx: node.randomx_hash,
                status: node.status.bits(),
            })
            .collect();
        blocks.sort_by_key(|b| (b.height, b.hash));

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            genesis_hash,
            tip_hash,
            block_count: blocks.len() as u64,
            blocks,
        };

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        fs::rename(&tmp, path)?;
        debug!(target: "chain", blocks = snapshot.block_count, %tip_hash, "chain snapshot saved");
        Ok(())
    }

    /// Loads a snapshot. Returns `Ok(None)` when no snapshot exists. The
    /// genesis hash is validated before any node is built, so a mismatching
    /// file leaves the caller's state untouched.
    pub fn load(path: &Path, params: &ConsensusParams) -> Result<Option<BlockStore>, StoreError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.genesis_hash != params.genesis_hash() {
            warn!(target: "chain", file = %snapshot.genesis_hash, expected = %params.genesis_hash(),
                  "refusing snapshot for a different network");
            return Err(StoreError::GenesisMismatch);
        }

        let mut blocks = snapshot.blocks;
        blocks.sort_by_key(|b| b.height);

        let mut store = BlockStore::new();
        for block in &blocks {
            let parent = if block.prev_hash.is_null() {
                if block.height != 0 {
                    return Err(StoreError::Corrupt(format!(
                        "block {} at height {} has a null parent",
                        block.hash, block.height
                    )));
                }
                None
            } else {
                Some(store.lookup(&block.prev_hash).ok_or_else(|| {
                    StoreError::Corrupt(format!("missing parent {} of {}", block.prev_hash, block.hash))
                })?)
            };
            let header = BlockHeader {
                version: block.version,
                prev_hash: block.prev_hash,
                miner_address: block.miner_address,
                time: block.time,
                bits: block.bits,
                nonce: block.nonce,
                randomx_hash: block.hash_randomx,
            };
            if header.hash() != block.hash {
                return Err(StoreError::Corrupt(format!(
                    "stored hash {} does not match header contents",
                    block.hash
                )));
            }
            let id = store.add_to_index(&header, parent);
            let node = &mut store[id];
            node.status = BlockStatus::from_bits(block.status);
            if node.height != block.height {
                return Err(StoreError::Corrupt(format!(
                    "height mismatch for {}: stored {}, derived {}",
                    block.hash, block.height, node.height
                )));
            }
        }

        if !snapshot.tip_hash.is_null() {
            let tip = store.lookup(&snapshot.tip_hash).ok_or_else(|| {
                StoreError::Corrupt(format!("tip {} not present in snapshot", snapshot.tip_hash))
            })?;
            store.set_tip(tip);
        }
        info!(target: "chain", blocks = store.len(), tip = %snapshot.tip_hash, "chain snapshot loaded");
        Ok(Some(store))
    }
}

impl Index<NodeId> for BlockStore {
    type Output = BlockIndexNode;

    fn index(&self, id: NodeId) -> &BlockIndexNode {
        self.get(id).expect("block index id refers to a live node")
    }
}

impl IndexMut<NodeId> for BlockStore {
    fn index_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        self.get_mut(id).expect("block index id refers to a live node")
    }
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    genesis_hash: Hash256,
    tip_hash: Hash256,
    block_count: u64,
    blocks: Vec<SnapshotBlock>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotBlock {
    hash: Hash256,
    height: u64,
    chainwork: U256,
    version: i32,
    prev_hash: Hash256,
    miner_address: Hash160,
    time: u32,
    bits: u32,
    nonce: u32,
    hash_randomx: Hash256,
    status: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::Network;

    fn params() -> ConsensusParams {
        ConsensusParams::for_network(Network::Regtest)
    }

    /// Builds `count` headers on top of genesis with distinct times.
    fn build_chain(store: &mut BlockStore, params: &ConsensusParams, count: u64) -> Vec<NodeId> {
        let genesis = params.genesis_header();
        let mut ids = vec![store.add_to_index(genesis, None)];
        let mut prev_hash = genesis.hash();
        for i in 0..count {
            let header = BlockHeader {
                version: 1,
                prev_hash,
                miner_address: Hash160::ZERO,
                time: genesis.time + 60 * (i as u32 + 1),
                bits: params.pow_limit_bits,
                nonce: i as u32,
                randomx_hash: Hash256::ZERO,
            };
            prev_hash = header.hash();
            let parent = *ids.last().unwrap();
            ids.push(store.add_to_index(&header, Some(parent)));
        }
        ids
    }

    #[test]
    fn height_and_work_accumulate() {
        let params = params();
        let mut store = BlockStore::new();
        let ids = build_chain(&mut store, &params, 5);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(store[*id].height, i as u64);
            if i > 0 {
                assert!(store[*id].chain_work > store[ids[i - 1]].chain_work);
            }
        }
    }

    #[test]
    fn duplicate_insert_returns_existing_id() {
        let params = params();
        let mut store = BlockStore::new();
        let genesis = params.genesis_header();
        let a = store.add_to_index(genesis, None);
        let b = store.add_to_index(genesis, None);
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn active_chain_membership_rule() {
        let params = params();
        let mut store = BlockStore::new();
        let ids = build_chain(&mut store, &params, 4);
        store.set_tip(ids[4]);
        assert_eq!(store.tip(), Some(ids[4]));
        assert!(store.is_active(ids[2]));
        assert_eq!(store.at_height(3), Some(ids[3]));

        // A fork off height 2 is not active.
        let fork_header = BlockHeader {
            version: 1,
            prev_hash: store[ids[2]].hash,
            miner_address: Hash160::ZERO,
            time: store[ids[2]].time + 30,
            bits: params.pow_limit_bits,
            nonce: 0xdead,
            randomx_hash: Hash256::ZERO,
        };
        let fork = store.add_to_index(&fork_header, Some(ids[2]));
        assert!(!store.is_active(fork));
        assert_eq!(store[fork].height, 3);
    }

    #[test]
    fn push_and_pop_tip_track_set_tip() {
        let params = params();
        let mut store = BlockStore::new();
        let ids = build_chain(&mut store, &params, 3);
        store.set_tip(ids[2]);
        store.push_tip(ids[3]);
        assert_eq!(store.tip(), Some(ids[3]));
        assert_eq!(store.pop_tip(), Some(ids[3]));
        assert_eq!(store.tip(), Some(ids[2]));
        // Genesis is never popped.
        store.set_tip(ids[0]);
        assert_eq!(store.pop_tip(), None);
    }

    #[test]
    fn ancestor_and_lca() {
        let params = params();
        let mut store = BlockStore::new();
        let ids = build_chain(&mut store, &params, 10);
        store.set_tip(ids[10]);
        assert_eq!(store.get_ancestor(ids[10], 4), Some(ids[4]));
        assert_eq!(store.get_ancestor(ids[3], 7), None);

        // Fork at height 5.
        let mut prev_hash = store[ids[5]].hash;
        let mut fork_ids = vec![ids[5]];
        for i in 0..3u32 {
            let header = BlockHeader {
                version: 1,
                prev_hash,
                miner_address: Hash160::ZERO,
                time: store[ids[5]].time + 7 + i,
                bits: params.pow_limit_bits,
                nonce: 0xf000 + i,
                randomx_hash: Hash256::ZERO,
            };
            prev_hash = header.hash();
            let parent = *fork_ids.last().unwrap();
            fork_ids.push(store.add_to_index(&header, Some(parent)));
        }
        let fork_tip = *fork_ids.last().unwrap();
        assert_eq!(store.last_common_ancestor(ids[10], fork_tip), Some(ids[5]));
        assert_eq!(store.last_common_ancestor(fork_tip, ids[10]), Some(ids[5]));
        // Ancestor relationship: LCA(a, descendant-of-a) == a.
        assert_eq!(store.last_common_ancestor(ids[4], ids[10]), Some(ids[4]));
    }

    #[test]
    fn median_time_past_matches_window() {
        let params = params();
        let mut store = BlockStore::new();
        let ids = build_chain(&mut store, &params, 15);
        // Times are strictly increasing by 60s, so the median of the last 11
        // (heights 5..=15) is the time at height 10.
        assert_eq!(store.median_time_past(ids[15]), store[ids[10]].time);
        // Near genesis the window shrinks: median of heights 0..=2.
        assert_eq!(store.median_time_past(ids[2]), store[ids[1]].time);
    }

    #[test]
    fn locator_shape() {
        let params = params();
        let mut store = BlockStore::new();
        let ids = build_chain(&mut store, &params, 200);
        store.set_tip(ids[200]);
        let locator = store.locator(ids[200]);
        assert!(locator.len() <= MAX_LOCATOR_SIZE);
        assert_eq!(locator[0], store[ids[200]].hash);
        assert_eq!(*locator.last().unwrap(), store[ids[0]].hash);
        // First ten steps are dense.
        for i in 0..10 {
            assert_eq!(locator[i], store[ids[200 - i]].hash);
        }
        // Short chains still terminate at genesis.
        let short = store.locator(ids[3]);
        assert_eq!(short.len(), 4);
        assert_eq!(*short.last().unwrap(), store[ids[0]].hash);
    }

    #[test]
    fn remove_node_frees_slot_for_reuse() {
        let params = params();
        let mut store = BlockStore::new();
        let ids = build_chain(&mut store, &params, 3);
        let removed_hash = store[ids[3]].hash;
        store.remove_node(ids[3]);
        assert_eq!(store.lookup(&removed_hash), None);
        assert!(!store[ids[2]].children.contains(&ids[3]));
        assert_eq!(store.len(), 3);

        // The freed slot is recycled.
        let header = BlockHeader {
            version: 1,
            prev_hash: store[ids[2]].hash,
            miner_address: Hash160::ZERO,
            time: store[ids[2]].time + 99,
            bits: params.pow_limit_bits,
            nonce: 7,
            randomx_hash: Hash256::ZERO,
        };
        let new_id = store.add_to_index(&header, Some(ids[2]));
        assert_eq!(new_id, ids[3]);
    }

    #[test]
    fn snapshot_round_trip() {
        let params = params();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainstate.json");

        let mut store = BlockStore::new();
        let ids = build_chain(&mut store, &params, 8);
        store.set_tip(ids[8]);
        store[ids[8]].status.insert(BlockStatus::VALID_TREE);
        store.save(&path, params.genesis_hash()).unwrap();

        let loaded = BlockStore::load(&path, &params).unwrap().unwrap();
        assert_eq!(loaded.len(), store.len());
        let tip = loaded.tip().unwrap();
        assert_eq!(loaded[tip].hash, store[ids[8]].hash);
        assert_eq!(loaded[tip].height, 8);
        assert!(loaded[tip].status.has(BlockStatus::VALID_TREE));
        for (_, node) in loaded.iter() {
            let original = store.lookup(&node.hash).unwrap();
            assert_eq!(store[original].chain_work, node.chain_work);
        }
    }

    #[test]
    fn snapshot_for_wrong_network_is_refused() {
        let regtest = params();
        let main = ConsensusParams::for_network(Network::Main);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainstate.json");

        let mut store = BlockStore::new();
        build_chain(&mut store, &regtest, 2);
        store.save(&path, regtest.genesis_hash()).unwrap();

        match BlockStore::load(&path, &main) {
            Err(StoreError::GenesisMismatch) => {}
            other => panic!("expected GenesisMismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_snapshot_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainstate.json");
        assert!(BlockStore::load(&path, &params()).unwrap().is_none());
    }
}
