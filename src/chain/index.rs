//! Per-header metadata nodes.
//!
//! Nodes live in the store's arena and refer to each other by [`NodeId`],
//! never by pointer; "same node" is id equality. Height and cumulative work
//! are set once at insertion and never change afterwards — the candidate
//! set sorts on them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::block::BlockHeader;
use crate::primitives::{Hash160, Hash256, U256};

/// Stable index of a node in the block store's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Validation progress / failure flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockStatus(u8);

impl BlockStatus {
    pub const VALID_HEADER: BlockStatus = BlockStatus(1 << 0);
    pub const VALID_TREE: BlockStatus = BlockStatus(1 << 1);
    pub const FAILED_VALID: BlockStatus = BlockStatus(1 << 2);
    pub const FAILED_CHILD: BlockStatus = BlockStatus(1 << 3);

    pub fn has(&self, flag: BlockStatus) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: BlockStatus) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: BlockStatus) {
        self.0 &= !flag.0;
    }

    /// Either failed itself or descends from a failure.
    pub fn is_failed(&self) -> bool {
        self.0 & (Self::FAILED_VALID.0 | Self::FAILED_CHILD.0) != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        BlockStatus(bits & 0x0f)
    }
}

/// In-memory record for one known header.
#[derive(Debug, Clone)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// 0 for genesis; immutable once set.
    pub height: u64,
    /// Cumulative proof since genesis; immutable once set.
    pub chain_work: U256,
    pub status: BlockStatus,

    // Inlined header fields (prev_hash is recovered via `parent`).
    pub version: i32,
    pub miner_address: Hash160,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub randomx_hash: Hash256,
}

impl BlockIndexNode {
    /// Rebuilds the wire header. The caller supplies the parent hash because
    /// the node stores only the parent's arena id.
    pub fn to_header(&self, prev_hash: Hash256) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_hash,
            miner_address: self.miner_address,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
            randomx_hash: self.randomx_hash,
        }
    }
}
