//! Network-wide immutable consensus parameters.

use std::fmt;
use std::str::FromStr;

use crate::block::BlockHeader;
use crate::primitives::{Hash160, Hash256, U256};

/// Which chain this node follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        }
    }

    /// Wire magic prefixing every framed message on this network.
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Main => [0xe4, 0xb1, 0xd7, 0x3a],
            Network::Test => [0x5c, 0xa9, 0xf0, 0x62],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Main => 7372,
            Network::Test => 17372,
            Network::Regtest => 27372,
        }
    }

    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            Network::Main => &["seed1.embernetwork.org", "seed2.embernetwork.org"],
            Network::Test => &["testnet-seed.embernetwork.org"],
            Network::Regtest => &[],
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Timestamps may lead adjusted network time by at most this many seconds.
pub const MAX_FUTURE_BLOCK_TIME: u32 = 15 * 60;

/// Median-time-past window (last 11 blocks inclusive).
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Immutable consensus parameters for one network.
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub network: Network,
    /// Highest (easiest) admissible target.
    pub pow_limit: U256,
    /// Compact form of `pow_limit`; the bits of every genesis header.
    pub pow_limit_bits: u32,
    /// Ideal seconds between blocks.
    pub pow_target_spacing: u32,
    /// Seconds per RandomX key epoch.
    pub randomx_epoch_duration: u32,
    /// Exponential retarget half-life in seconds.
    pub asert_half_life: i64,
    /// Height of the retarget anchor block.
    pub asert_anchor_height: u64,
    /// Headers chains below this cumulative work are not interesting.
    pub minimum_chain_work: U256,
    /// When set, the network refuses blocks at and above this height.
    pub network_expiration_height: Option<u64>,
    /// Blocks of tip-rate proof backing the anti-DoS headers threshold.
    pub anti_dos_work_buffer_blocks: u64,
    genesis: BlockHeader,
    genesis_hash: Hash256,
}

impl ConsensusParams {
    pub fn for_network(network: Network) -> Self {
        let (pow_limit_bits, genesis_time, minimum_chain_work) = match network {
            Network::Main => (0x1e00ffffu32, 1735689600u32, U256::from_u64(0x0010_0000)),
            Network::Test => (0x1e00ffff, 1735693200, U256::ZERO),
            Network::Regtest => (0x207fffff, 1296688602, U256::ZERO),
        };
        let pow_limit = U256::from_compact(pow_limit_bits)
            .expect("pow limit compact form is a constant and decodes");
        let genesis = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            miner_address: Hash160::ZERO,
            time: genesis_time,
            bits: pow_limit_bits,
            nonce: 0,
            randomx_hash: Hash256::ZERO,
        };
        let genesis_hash = genesis.hash();
        ConsensusParams {
            network,
            pow_limit,
            pow_limit_bits,
            pow_target_spacing: match network {
                Network::Regtest => 1,
                _ => 600,
            },
            randomx_epoch_duration: 7 * 24 * 3600,
            asert_half_life: 2 * 24 * 3600,
            asert_anchor_height: 1,
            minimum_chain_work,
            network_expiration_height: None,
            anti_dos_work_buffer_blocks: 144,
            genesis,
            genesis_hash,
        }
    }

    pub fn genesis_header(&self) -> &BlockHeader {
        &self.genesis
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networks_have_distinct_magic_and_ports() {
        let nets = [Network::Main, Network::Test, Network::Regtest];
        for a in nets {
            for b in nets {
                if a != b {
                    assert_ne!(a.magic(), b.magic());
                    assert_ne!(a.default_port(), b.default_port());
                }
            }
        }
    }

    #[test]
    fn genesis_hash_is_stable_per_network() {
        let main = ConsensusParams::for_network(Network::Main);
        let test = ConsensusParams::for_network(Network::Test);
        assert_eq!(main.genesis_hash(), main.genesis_header().hash());
        assert_ne!(main.genesis_hash(), test.genesis_hash());
    }

    #[test]
    fn pow_limit_matches_its_compact_form() {
        for net in [Network::Main, Network::Test, Network::Regtest] {
            let p = ConsensusParams::for_network(net);
            assert_eq!(U256::from_compact(p.pow_limit_bits).unwrap(), p.pow_limit);
            assert!(!p.pow_limit.is_zero());
        }
    }

    #[test]
    fn network_parses_from_config_names() {
        assert_eq!("main".parse::<Network>().unwrap(), Network::Main);
        assert_eq!("TESTNET".parse::<Network>().unwrap(), Network::Test);
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert!("bogus".parse::<Network>().is_err());
    }
}
