//! Candidate-tip tracking and best-chain selection.
//!
//! An ordered set of leaf tips, most work first (height, then hash, break
//! ties deterministically). Only leaves are admitted: a node with a live,
//! non-failed child can never be the best tip. Activation prunes dominated
//! candidates and ancestors of the new tip.

use std::collections::BTreeSet;

use crate::chain::index::NodeId;
use crate::chain::store::BlockStore;
use crate::primitives::{Hash256, U256};

/// Sort key: work desc, height desc, hash asc. `Ord` is written so that the
/// *first* element of the set is the best candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CandidateKey {
    work: U256,
    height: u64,
    hash: Hash256,
    id: NodeId,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .work
            .cmp(&self.work)
            .then_with(|| other.height.cmp(&self.height))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct CandidateSet {
    ordered: BTreeSet<CandidateKey>,
}

impl CandidateSet {
    pub fn new() -> Self {
        CandidateSet::default()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    fn key_for(store: &BlockStore, id: NodeId) -> CandidateKey {
        let node = &store[id];
        CandidateKey {
            work: node.chain_work,
            height: node.height,
            hash: node.hash,
            id,
        }
    }

    /// Admits `id` if it is a leaf (no live, non-failed children) and not
    /// itself failed. Returns whether it was inserted.
    pub fn try_add(&mut self, store: &BlockStore, id: NodeId) -> bool {
        let node = &store[id];
        if node.status.is_failed() {
            return false;
        }
        let has_valid_child = node
            .children
            .iter()
            .any(|c| store.get(*c).map(|n| !n.status.is_failed()).unwrap_or(false));
        if has_valid_child {
            return false;
        }
        self.ordered.insert(Self::key_for(store, id))
    }

    pub fn remove(&mut self, store: &BlockStore, id: NodeId) {
        self.ordered.remove(&Self::key_for(store, id));
    }

    pub fn contains(&self, store: &BlockStore, id: NodeId) -> bool {
        self.ordered.contains(&Self::key_for(store, id))
    }

    /// Best candidate by (work, height, hash).
    pub fn find_most_work(&self) -> Option<NodeId> {
        self.ordered.iter().next().map(|k| k.id)
    }

    /// Drops candidates that can never beat the active tip: everything with
    /// no more work than the tip, plus any ancestor of the tip itself. The
    /// tip is re-admitted so the set always contains the current best.
    pub fn prune(&mut self, store: &BlockStore, tip: NodeId) {
        let tip_work = store[tip].chain_work;
        let keep: Vec<CandidateKey> = self
            .ordered
            .iter()
            .filter(|k| {
                if k.id == tip {
                    return true;
                }
                if k.work <= tip_work {
                    return false;
                }
                store.last_common_ancestor(k.id, tip) != Some(k.id)
            })
            .copied()
            .collect();
        self.ordered = keep.into_iter().collect();
        self.try_add(store, tip);
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.ordered.iter().map(|k| k.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHeader;
    use crate::chain::index::BlockStatus;
    use crate::consensus::params::Network;
    use crate::consensus::ConsensusParams;
    use crate::primitives::Hash160;

    fn setup() -> (BlockStore, ConsensusParams) {
        let params = ConsensusParams::for_network(Network::Regtest);
        let mut store = BlockStore::new();
        store.add_to_index(params.genesis_header(), None);
        (store, params)
    }

    fn extend(store: &mut BlockStore, params: &ConsensusParams, parent: NodeId, nonce: u32) -> NodeId {
        let header = BlockHeader {
            version: 1,
            prev_hash: store[parent].hash,
            miner_address: Hash160::ZERO,
            time: store[parent].time + 60,
            bits: params.pow_limit_bits,
            nonce,
            randomx_hash: Hash256::ZERO,
        };
        store.add_to_index(&header, Some(parent))
    }

    #[test]
    fn ordering_prefers_work_then_height_then_hash() {
        let (mut store, params) = setup();
        let genesis = store.at_height(0).unwrap_or(NodeId(0));
        let a1 = extend(&mut store, &params, genesis, 1);
        let a2 = extend(&mut store, &params, a1, 2);
        let b1 = extend(&mut store, &params, genesis, 3);

        let mut set = CandidateSet::new();
        assert!(set.try_add(&store, a2));
        assert!(set.try_add(&store, b1));
        // a2 has strictly more cumulative work.
        assert_eq!(set.find_most_work(), Some(a2));

        // Equal-work, equal-height tips tie-break on hash ascending.
        let b2 = extend(&mut store, &params, b1, 4);
        set.try_add(&store, b2);
        let expected = if store[a2].hash < store[b2].hash { a2 } else { b2 };
        assert_eq!(set.find_most_work(), Some(expected));
    }

    #[test]
    fn non_leaves_are_rejected() {
        let (mut store, params) = setup();
        let genesis = NodeId(0);
        let a1 = extend(&mut store, &params, genesis, 1);
        let _a2 = extend(&mut store, &params, a1, 2);

        let mut set = CandidateSet::new();
        assert!(!set.try_add(&store, a1), "a1 has a live child");
        assert!(!set.try_add(&store, genesis));
    }

    #[test]
    fn failed_children_do_not_block_their_parent() {
        let (mut store, params) = setup();
        let genesis = NodeId(0);
        let a1 = extend(&mut store, &params, genesis, 1);
        let a2 = extend(&mut store, &params, a1, 2);
        store[a2].status.insert(BlockStatus::FAILED_VALID);

        let mut set = CandidateSet::new();
        assert!(set.try_add(&store, a1), "only child is failed, a1 is a leaf");
        assert!(!set.try_add(&store, a2), "failed nodes are never candidates");
    }

    #[test]
    fn prune_drops_dominated_and_ancestors() {
        let (mut store, params) = setup();
        let genesis = NodeId(0);
        let a1 = extend(&mut store, &params, genesis, 1);
        let a2 = extend(&mut store, &params, a1, 2);
        let a3 = extend(&mut store, &params, a2, 3);
        let b1 = extend(&mut store, &params, genesis, 4);

        let mut set = CandidateSet::new();
        set.try_add(&store, a3);
        set.try_add(&store, b1);
        store.set_tip(a3);
        set.prune(&store, a3);

        // b1 (less work) is gone; the tip remains.
        assert_eq!(set.len(), 1);
        assert_eq!(set.find_most_work(), Some(a3));
    }

    #[test]
    fn remove_is_exact() {
        let (mut store, params) = setup();
        let genesis = NodeId(0);
        let a1 = extend(&mut store, &params, genesis, 1);
        let b1 = extend(&mut store, &params, genesis, 2);
        let mut set = CandidateSet::new();
        set.try_add(&store, a1);
        set.try_add(&store, b1);
        set.remove(&store, a1);
        assert!(!set.contains(&store, a1));
        assert!(set.contains(&store, b1));
    }
}
