//! The 100-byte block header and its hashes.
//!
//! Fixed wire layout, little-endian scalars, raw byte order for hashes:
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 4    | version (i32)  |
//! | 4      | 32   | prev_hash      |
//! | 36     | 20   | miner_address  |
//! | 56     | 4    | time           |
//! | 60     | 4    | bits           |
//! | 64     | 4    | nonce          |
//! | 68     | 32   | randomx_hash   |

use crate::primitives::{double_sha256, Hash160, Hash256};

/// Header of a block. The miner address takes the slot a Merkle root would
/// occupy on a transaction-bearing chain; the committed RandomX output is
/// appended after the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub miner_address: Hash160,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub randomx_hash: Hash256,
}

/// Serialized size of the prefix the RandomX hash commits to.
pub const POW_PREFIX_SIZE: usize = 4 + 32 + 20 + 4 + 4 + 4;

impl BlockHeader {
    /// Serialized size on the wire.
    pub const SIZE: usize = POW_PREFIX_SIZE + 32;

    /// Serialize to the fixed wire layout.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_hash.as_bytes());
        out[36..56].copy_from_slice(self.miner_address.as_bytes());
        out[56..60].copy_from_slice(&self.time.to_le_bytes());
        out[60..64].copy_from_slice(&self.bits.to_le_bytes());
        out[64..68].copy_from_slice(&self.nonce.to_le_bytes());
        out[68..100].copy_from_slice(self.randomx_hash.as_bytes());
        out
    }

    /// Deserialize from exactly [`Self::SIZE`] bytes.
    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[0..4]);
        let mut time = [0u8; 4];
        time.copy_from_slice(&bytes[56..60]);
        let mut bits = [0u8; 4];
        bits.copy_from_slice(&bytes[60..64]);
        let mut nonce = [0u8; 4];
        nonce.copy_from_slice(&bytes[64..68]);
        BlockHeader {
            version: i32::from_le_bytes(version),
            prev_hash: Hash256::from_slice(&bytes[4..36]).expect("fixed slice"),
            miner_address: Hash160::from_slice(&bytes[36..56]).expect("fixed slice"),
            time: u32::from_le_bytes(time),
            bits: u32::from_le_bytes(bits),
            nonce: u32::from_le_bytes(nonce),
            randomx_hash: Hash256::from_slice(&bytes[68..100]).expect("fixed slice"),
        }
    }

    /// Canonical block hash: double-SHA256 over the full 100 bytes.
    pub fn hash(&self) -> Hash256 {
        Hash256::new(double_sha256(&self.encode()))
    }

    /// The 68-byte prefix the RandomX hash is computed over (everything up to
    /// and excluding the committed hash itself).
    pub fn pow_prefix(&self) -> [u8; POW_PREFIX_SIZE] {
        let mut out = [0u8; POW_PREFIX_SIZE];
        out.copy_from_slice(&self.encode()[..POW_PREFIX_SIZE]);
        out
    }

    /// Commitment hash: double-SHA256 over the PoW prefix followed by a
    /// RandomX output. With `self.randomx_hash` as the output this is the
    /// canonical hash recomputed from parts; during mining the candidate
    /// RandomX hash is committed before the header field is filled in.
    pub fn commitment_hash(&self, randomx_hash: &Hash256) -> Hash256 {
        let mut buf = [0u8; Self::SIZE];
        buf[..POW_PREFIX_SIZE].copy_from_slice(&self.pow_prefix());
        buf[POW_PREFIX_SIZE..].copy_from_slice(randomx_hash.as_bytes());
        Hash256::new(double_sha256(&buf))
    }
}

// The wire layout is consensus; a drifting field must not compile.
const _: () = assert!(BlockHeader::SIZE == 100);
const _: () = assert!(POW_PREFIX_SIZE == 68);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256::new([0x11; 32]),
            miner_address: Hash160::new([0x22; 20]),
            time: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: 42,
            randomx_hash: Hash256::new([0x33; 32]),
        }
    }

    #[test]
    fn encode_is_exactly_100_bytes_and_round_trips() {
        let h = sample_header();
        let bytes = h.encode();
        assert_eq!(bytes.len(), 100);
        assert_eq!(BlockHeader::decode(&bytes), h);
    }

    #[test]
    fn field_offsets_match_layout() {
        let h = sample_header();
        let bytes = h.encode();
        assert_eq!(&bytes[0..4], &1i32.to_le_bytes());
        assert_eq!(&bytes[4..36], &[0x11; 32]);
        assert_eq!(&bytes[36..56], &[0x22; 20]);
        assert_eq!(&bytes[56..60], &1_700_000_000u32.to_le_bytes());
        assert_eq!(&bytes[60..64], &0x1d00ffffu32.to_le_bytes());
        assert_eq!(&bytes[64..68], &42u32.to_le_bytes());
        assert_eq!(&bytes[68..100], &[0x33; 32]);
    }

    #[test]
    fn hash_is_deterministic_and_nonce_sensitive() {
        let h = sample_header();
        assert_eq!(h.hash(), h.hash());
        let mut h2 = h;
        h2.nonce += 1;
        assert_ne!(h.hash(), h2.hash());
    }

    #[test]
    fn commitment_over_own_randomx_hash_equals_canonical_hash() {
        let h = sample_header();
        assert_eq!(h.commitment_hash(&h.randomx_hash), h.hash());
    }

    #[test]
    fn commitment_varies_with_candidate_hash() {
        let h = sample_header();
        let other = Hash256::new([0x44; 32]);
        assert_ne!(h.commitment_hash(&other), h.hash());
    }
}
