//! Orphan header pool.
//!
//! Headers whose parent is unknown wait here until the parent arrives.
//! Caps are enforced before anything is stored: a hard global limit, a
//! small per-peer limit, and an age limit. Global overflow evicts the
//! oldest orphan from whichever peer has the most cached.

use std::collections::HashMap;

use tracing::debug;

use crate::block::BlockHeader;
use crate::consensus::validation::ValidationError;
use crate::primitives::Hash256;

/// Hard cap across all peers.
pub const MAX_ORPHAN_HEADERS: usize = 1000;

/// Cap for any single peer.
pub const MAX_ORPHANS_PER_PEER: usize = 3;

/// Seconds an orphan may wait for its parent.
pub const ORPHAN_EXPIRY_SECS: u64 = 10 * 60;

#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub header: BlockHeader,
    pub received: u64,
    pub peer: Option<u64>,
}

#[derive(Default)]
pub struct OrphanPool {
    by_hash: HashMap<Hash256, OrphanEntry>,
    /// prev_hash -> orphan hashes waiting on it.
    by_parent: HashMap<Hash256, Vec<Hash256>>,
    per_peer: HashMap<u64, usize>,
}

impl OrphanPool {
    pub fn new() -> Self {
        OrphanPool::default()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn peer_count(&self, peer: u64) -> usize {
        self.per_peer.get(&peer).copied().unwrap_or(0)
    }

    /// Caches a parentless header. Caps are checked before insertion; a full
    /// pool evicts rather than failing, so the only rejections are the
    /// per-peer limit and (degenerate) an unevictable pool.
    pub fn try_add(
        &mut self,
        header: BlockHeader,
        peer: Option<u64>,
        now: u64,
    ) -> Result<(), ValidationError> {
        let hash = header.hash();
        if self.by_hash.contains_key(&hash) {
            return Ok(());
        }
        if let Some(peer) = peer {
            if self.peer_count(peer) >= MAX_ORPHANS_PER_PEER {
                return Err(ValidationError::TooManyOrphans);
            }
        }
        if self.by_hash.len() >= MAX_ORPHAN_HEADERS && !self.evict_one() {
            return Err(ValidationError::OrphanPoolFull);
        }

        debug!(target: "chain", %hash, ?peer, "caching orphan header");
        self.by_parent.entry(header.prev_hash).or_default().push(hash);
        if let Some(peer) = peer {
            *self.per_peer.entry(peer).or_insert(0) += 1;
        }
        self.by_hash.insert(
            hash,
            OrphanEntry {
                header,
                received: now,
                peer,
            },
        );
        Ok(())
    }

    /// Removes and returns every cached orphan whose parent is `parent`.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<OrphanEntry> {
        let Some(hashes) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        hashes
            .into_iter()
            .filter_map(|hash| self.remove_entry(&hash))
            .collect()
    }

    /// Drops entries older than [`ORPHAN_EXPIRY_SECS`]; returns how many.
    pub fn expire(&mut self, now: u64) -> usize {
        let expired: Vec<Hash256> = self
            .by_hash
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.received) >= ORPHAN_EXPIRY_SECS)
            .map(|(h, _)| *h)
            .collect();
        for hash in &expired {
            self.remove_entry(hash);
        }
        if !expired.is_empty() {
            debug!(target: "chain", count = expired.len(), "expired orphan headers");
        }
        expired.len()
    }

    /// Drops every orphan received from `peer` (used when a peer is banned).
    pub fn remove_peer(&mut self, peer: u64) -> usize {
        let doomed: Vec<Hash256> = self
            .by_hash
            .iter()
            .filter(|(_, e)| e.peer == Some(peer))
            .map(|(h, _)| *h)
            .collect();
        for hash in &doomed {
            self.remove_entry(hash);
        }
        doomed.len()
    }

    /// Oldest orphan of the heaviest-caching peer goes first.
    fn evict_one(&mut self) -> bool {
        let heaviest = self
            .per_peer
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(peer, _)| *peer);
        let victim = self
            .by_hash
            .iter()
            .filter(|(_, e)| match heaviest {
                Some(p) => e.peer == Some(p),
                None => true,
            })
            .min_by_key(|(_, e)| e.received)
            .map(|(h, _)| *h)
            // No per-peer attribution at all: fall back to global oldest.
            .or_else(|| {
                self.by_hash
                    .iter()
                    .min_by_key(|(_, e)| e.received)
                    .map(|(h, _)| *h)
            });
        match victim {
            Some(hash) => {
                debug!(target: "chain", %hash, "evicting orphan header");
                self.remove_entry(&hash).is_some()
            }
            None => false,
        }
    }

    fn remove_entry(&mut self, hash: &Hash256) -> Option<OrphanEntry> {
        let entry = self.by_hash.remove(hash)?;
        if let Some(waiting) = self.by_parent.get_mut(&entry.header.prev_hash) {
            waiting.retain(|h| h != hash);
            if waiting.is_empty() {
                self.by_parent.remove(&entry.header.prev_hash);
            }
        }
        if let Some(peer) = entry.peer {
            if let Some(count) = self.per_peer.get_mut(&peer) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.per_peer.remove(&peer);
                }
            }
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::Hash160;

    fn orphan(parent: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: parent,
            miner_address: Hash160::ZERO,
            time: 1_000_000,
            bits: 0x207fffff,
            nonce,
            randomx_hash: Hash256::ZERO,
        }
    }

    #[test]
    fn per_peer_cap_rejects() {
        let mut pool = OrphanPool::new();
        for i in 0..MAX_ORPHANS_PER_PEER as u32 {
            pool.try_add(orphan(Hash256::new([1; 32]), i), Some(7), 100).unwrap();
        }
        let err = pool
            .try_add(orphan(Hash256::new([1; 32]), 99), Some(7), 100)
            .unwrap_err();
        assert_eq!(err, ValidationError::TooManyOrphans);
        // A different peer still has room.
        pool.try_add(orphan(Hash256::new([1; 32]), 100), Some(8), 100).unwrap();
        assert_eq!(pool.peer_count(7), MAX_ORPHANS_PER_PEER);
        assert_eq!(pool.peer_count(8), 1);
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let mut pool = OrphanPool::new();
        let h = orphan(Hash256::new([2; 32]), 1);
        pool.try_add(h, Some(1), 100).unwrap();
        pool.try_add(h, Some(1), 200).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.peer_count(1), 1);
    }

    #[test]
    fn take_children_returns_and_clears() {
        let mut pool = OrphanPool::new();
        let parent = Hash256::new([3; 32]);
        pool.try_add(orphan(parent, 1), Some(1), 100).unwrap();
        pool.try_add(orphan(parent, 2), Some(2), 100).unwrap();
        pool.try_add(orphan(Hash256::new([4; 32]), 3), Some(1), 100).unwrap();

        let children = pool.take_children(&parent);
        assert_eq!(children.len(), 2);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.peer_count(1), 1);
        assert_eq!(pool.peer_count(2), 0);
        assert!(pool.take_children(&parent).is_empty());
    }

    #[test]
    fn expiry_is_age_based() {
        let mut pool = OrphanPool::new();
        pool.try_add(orphan(Hash256::new([5; 32]), 1), Some(1), 100).unwrap();
        pool.try_add(orphan(Hash256::new([5; 32]), 2), Some(1), 400).unwrap();
        assert_eq!(pool.expire(100 + ORPHAN_EXPIRY_SECS), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn global_overflow_evicts_oldest_of_heaviest_peer() {
        let mut pool = OrphanPool::new();
        // Fill to the global cap from many distinct "peers" so no per-peer
        // cap interferes (peer ids are synthetic).
        let mut nonce = 0u32;
        let mut peer = 0u64;
        let mut received = 0u64;
        while pool.len() < MAX_ORPHAN_HEADERS {
            let mut parent = [0u8; 32];
            parent[..8].copy_from_slice(&(nonce as u64).to_le_bytes());
            pool.try_add(orphan(Hash256::new(parent), nonce), Some(peer), received)
                .unwrap();
            nonce += 1;
            received += 1;
            if pool.peer_count(peer) >= MAX_ORPHANS_PER_PEER {
                peer += 1;
            }
        }
        // Overflow: one of the heaviest peers loses its oldest entry and the
        // newcomer gets in without growing the pool.
        let newcomer = orphan(Hash256::new([9; 32]), 0xffff);
        let newcomer_hash = newcomer.hash();
        pool.try_add(newcomer, Some(999_999), received).unwrap();
        assert_eq!(pool.len(), MAX_ORPHAN_HEADERS);
        assert!(pool.contains(&newcomer_hash));
        assert_eq!(pool.peer_count(999_999), 1);
    }

    #[test]
    fn remove_peer_drops_their_orphans() {
        let mut pool = OrphanPool::new();
        pool.try_add(orphan(Hash256::new([6; 32]), 1), Some(1), 100).unwrap();
        pool.try_add(orphan(Hash256::new([6; 32]), 2), Some(2), 100).unwrap();
        assert_eq!(pool.remove_peer(1), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.peer_count(1), 0);
    }
}
