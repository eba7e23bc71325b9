//! RandomX proof-of-work verification.
//!
//! Three modes, in increasing cost:
//! - commitment-only: one double-SHA256 binding the committed RandomX output
//!   to the header and the target; the anti-DoS pre-filter;
//! - full: recompute the RandomX hash in the epoch's VM and require both
//!   equality with the committed output and the target bound;
//! - mining: compute and hand back the RandomX hash for a candidate prefix.
//!
//! Epoch keys rotate on a fixed wall-clock schedule. Building a VM for a new
//! epoch is expensive, so a peer may force at most one previously-unseen
//! epoch initialization per cooldown window.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::block::BlockHeader;
use crate::consensus::params::ConsensusParams;
use crate::consensus::randomx_vm::VmCache;
use crate::consensus::validation::{ValidationError, ValidationResult};
use crate::primitives::{double_sha256, Hash256, U256};

/// Minimum seconds between unseen-epoch VM initializations forced by one peer.
pub const EPOCH_INIT_COOLDOWN_SECS: u64 = 5 * 60;

const EPOCH_SEED_DOMAIN: &[u8] = b"ember/randomx/epoch";

thread_local! {
    static VM_CACHE: RefCell<Option<VmCache>> = const { RefCell::new(None) };
}

/// Process-lifetime RandomX verification service.
pub struct RandomxEngine {
    epoch_duration: u32,
    fast_mode: bool,
    vm_cache_size: usize,
    /// Epochs a VM has been built for at least once, on any thread.
    seen_epochs: Mutex<HashSet<u64>>,
    /// peer id -> unix time of its last unseen-epoch initialization.
    peer_epoch_inits: Mutex<HashMap<u64, u64>>,
}

impl RandomxEngine {
    pub fn new(params: &ConsensusParams, fast_mode: bool, vm_cache_size: usize) -> Self {
        RandomxEngine {
            epoch_duration: params.randomx_epoch_duration,
            fast_mode,
            vm_cache_size: vm_cache_size.max(2),
            seen_epochs: Mutex::new(HashSet::new()),
            peer_epoch_inits: Mutex::new(HashMap::new()),
        }
    }

    pub fn epoch_for_time(&self, time: u32) -> u64 {
        time as u64 / self.epoch_duration as u64
    }

    /// 32-byte RandomX key for an epoch: double-SHA256 over a domain tag and
    /// the epoch number. Deterministic and independent of chain content, so
    /// every node derives the same key without agreeing on a seed block.
    pub fn epoch_seed(epoch: u64) -> [u8; 32] {
        let mut buf = Vec::with_capacity(EPOCH_SEED_DOMAIN.len() + 8);
        buf.extend_from_slice(EPOCH_SEED_DOMAIN);
        buf.extend_from_slice(&epoch.to_le_bytes());
        double_sha256(&buf)
    }

    /// Commitment-only check: `SHA256d(prefix ‖ committed_hash)` must be
    /// strictly below the target. Costs microseconds; run before anything
    /// that could allocate a VM.
    pub fn check_commitment(&self, header: &BlockHeader, target: &U256) -> ValidationResult {
        let commitment = header.commitment_hash(&header.randomx_hash);
        if commitment.to_u256() >= *target {
            return Err(ValidationError::BadCommitment);
        }
        Ok(())
    }

    /// Full check: recompute RandomX over the PoW prefix in the header's
    /// epoch and require the committed hash to match and to meet the target.
    ///
    /// `peer` (when the header came from the network) is subject to the
    /// unseen-epoch cooldown; local submissions pass `None`.
    pub fn check_full(
        &self,
        header: &BlockHeader,
        target: &U256,
        peer: Option<u64>,
        now: u64,
    ) -> ValidationResult {
        let epoch = self.epoch_for_time(header.time);
        self.authorize_epoch_init(epoch, peer, now)?;
        let computed = self.randomx_hash(epoch, &header.pow_prefix())?;
        if computed != header.randomx_hash {
            return Err(ValidationError::BadPow);
        }
        if computed.to_u256() >= *target {
            return Err(ValidationError::BadPow);
        }
        Ok(())
    }

    /// Mining mode: RandomX over the candidate prefix, returning the hash for
    /// the miner to commit.
    pub fn mining_hash(&self, header: &BlockHeader) -> ValidationResult<Hash256> {
        let epoch = self.epoch_for_time(header.time);
        self.randomx_hash(epoch, &header.pow_prefix())
    }

    fn randomx_hash(&self, epoch: u64, input: &[u8]) -> ValidationResult<Hash256> {
        let seed = Self::epoch_seed(epoch);
        let out = VM_CACHE.with(|slot| {
            let mut slot = slot.borrow_mut();
            let cache = slot.get_or_insert_with(|| VmCache::new(self.fast_mode, self.vm_cache_size));
            cache.hash(epoch, &seed, input)
        });
        match out {
            Ok(bytes) => {
                self.seen_epochs.lock().insert(epoch);
                Ok(Hash256::new(bytes))
            }
            Err(e) => Err(ValidationError::Internal(format!("randomx: {e}"))),
        }
    }

    /// The cooldown rule: an epoch no VM has ever been built for counts as a
    /// forced initialization against the submitting peer.
    fn authorize_epoch_init(&self, epoch: u64, peer: Option<u64>, now: u64) -> ValidationResult {
        if self.seen_epochs.lock().contains(&epoch) {
            return Ok(());
        }
        let Some(peer) = peer else {
            return Ok(());
        };
        let mut inits = self.peer_epoch_inits.lock();
        if let Some(&last) = inits.get(&peer) {
            if now.saturating_sub(last) < EPOCH_INIT_COOLDOWN_SECS {
                return Err(ValidationError::EpochThrottled);
            }
        }
        inits.insert(peer, now);
        Ok(())
    }

    /// Drops throttle bookkeeping for a departed peer.
    pub fn forget_peer(&self, peer: u64) {
        self.peer_epoch_inits.lock().remove(&peer);
    }
}
