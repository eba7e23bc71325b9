//! Header validation rules and the typed failure taxonomy.
//!
//! Layering follows the acceptance pipeline:
//! - layer 1–2, context-free: compact bits decode, commitment pre-check and
//!   the full RandomX pass (those two live in [`crate::consensus::pow`]);
//! - layer 3, contextual: median-time-past, future-time bound, required
//!   difficulty, optional network expiration.
//!
//! The anti-DoS work threshold for unsolicited header batches also lives
//! here. All checks hold in release builds; nothing here is compiled out.

use thiserror::Error;

use crate::consensus::params::{ConsensusParams, MAX_FUTURE_BLOCK_TIME, MEDIAN_TIME_SPAN};
use crate::primitives::U256;

pub type ValidationResult<T = ()> = Result<T, ValidationError>;

/// Why a header (or a batch of headers) was rejected.
///
/// `Orphan` and `OrphanPoolFull` are retryable from the caller's point of
/// view; the permanent kinds mark the header itself invalid; the
/// session-level kinds describe peer behavior rather than a single header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    // -- retryable --------------------------------------------------------
    #[error("parent unknown, header cached as orphan")]
    Orphan,
    #[error("parent unknown and orphan pool is full")]
    OrphanPoolFull,
    #[error("header sync stalled")]
    Stalled,

    // -- permanent, per-header -------------------------------------------
    #[error("proof of work below target")]
    BadPow,
    #[error("pow commitment below target")]
    BadCommitment,
    #[error("difficulty bits do not match the schedule")]
    BadDiffBits,
    #[error("timestamp not greater than median time past")]
    TimeTooOld,
    #[error("timestamp too far in the future")]
    TimeTooNew,
    #[error("unsupported header version")]
    BadVersion,
    #[error("genesis header may only be installed at initialization")]
    BadGenesis,
    #[error("previous block is invalid")]
    BadPrevBlock,
    #[error("network has expired at this height")]
    NetworkExpired,
    #[error("difficulty retarget precondition violated")]
    InvalidDifficulty,

    // -- session-level ----------------------------------------------------
    #[error("headers batch carries too little work")]
    LowWorkHeaders,
    #[error("headers batch does not connect continuously")]
    NonContinuousHeaders,
    #[error("message exceeds protocol size limits")]
    OversizedMessage,
    #[error("invalid header")]
    InvalidHeader,
    #[error("too many unconnecting headers from peer")]
    TooManyUnconnecting,
    #[error("too many orphans from peer")]
    TooManyOrphans,
    #[error("peer forced RandomX epoch initializations too quickly")]
    EpochThrottled,

    // -- system -----------------------------------------------------------
    #[error("internal consistency violation: {0}")]
    Internal(String),
}

impl ValidationError {
    /// True for failures that mark the header itself permanently invalid
    /// (the node records the hash in the failed set).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ValidationError::BadPow
                | ValidationError::BadCommitment
                | ValidationError::BadDiffBits
                | ValidationError::TimeTooOld
                | ValidationError::TimeTooNew
                | ValidationError::BadVersion
                | ValidationError::BadGenesis
                | ValidationError::BadPrevBlock
                | ValidationError::NetworkExpired
                | ValidationError::InvalidDifficulty
        )
    }
}

/// Decodes `bits` and applies the range rules: positive mantissa, non-zero
/// target, no more than the network's proof-of-work limit.
pub fn decode_target(bits: u32, params: &ConsensusParams) -> ValidationResult<U256> {
    let target = U256::from_compact(bits).ok_or(ValidationError::BadDiffBits)?;
    if target.is_zero() || target > params.pow_limit {
        return Err(ValidationError::BadDiffBits);
    }
    Ok(target)
}

/// Proof contributed by one block at the given compact target:
/// `~target / (target + 1) + 1`.
pub fn block_proof(bits: u32) -> U256 {
    match U256::from_compact(bits) {
        Some(target) if !target.is_zero() => target.inverse(),
        _ => U256::ZERO,
    }
}

/// Median of the last [`MEDIAN_TIME_SPAN`] timestamps, newest last. The
/// slice may be shorter near genesis; an empty slice yields zero.
pub fn median_time_past(recent: &[u32]) -> u32 {
    let take = recent.len().min(MEDIAN_TIME_SPAN);
    if take == 0 {
        return 0;
    }
    let mut window: Vec<u32> = recent[recent.len() - take..].to_vec();
    window.sort_unstable();
    window[window.len() / 2]
}

/// Layer-3 inputs derived from the parent's position in the index.
#[derive(Debug, Clone, Copy)]
pub struct ContextualInfo {
    pub parent_height: u64,
    pub parent_mtp: u32,
    /// Bits the difficulty schedule demands for this block.
    pub required_bits: u32,
}

/// Contextual (layer-3) checks against the parent and the adjusted clock.
pub fn contextual_check(
    time: u32,
    bits: u32,
    ctx: &ContextualInfo,
    adjusted_time: u64,
    params: &ConsensusParams,
) -> ValidationResult {
    if let Some(expiry) = params.network_expiration_height {
        if ctx.parent_height + 1 >= expiry {
            return Err(ValidationError::NetworkExpired);
        }
    }
    if time <= ctx.parent_mtp {
        return Err(ValidationError::TimeTooOld);
    }
    if time as u64 > adjusted_time.saturating_add(MAX_FUTURE_BLOCK_TIME as u64) {
        return Err(ValidationError::TimeTooNew);
    }
    if bits != ctx.required_bits {
        return Err(ValidationError::BadDiffBits);
    }
    Ok(())
}

/// Minimum cumulative work an unsolicited headers chain must present.
///
/// During initial sync the floor is the network's `minimum_chain_work`.
/// Afterwards it trails the tip by `anti_dos_work_buffer_blocks` blocks of
/// tip-rate proof, with saturating arithmetic so a hostile tip cannot wrap
/// the buffer into a tiny threshold.
pub fn anti_dos_work_threshold(
    in_ibd: bool,
    tip: Option<(U256, u32)>,
    params: &ConsensusParams,
) -> U256 {
    if in_ibd {
        return params.minimum_chain_work;
    }
    match tip {
        None => params.minimum_chain_work,
        Some((tip_work, tip_bits)) => {
            let buffer = block_proof(tip_bits).saturating_mul_u64(params.anti_dos_work_buffer_blocks);
            tip_work.saturating_sub(buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::Network;

    fn params() -> ConsensusParams {
        ConsensusParams::for_network(Network::Main)
    }

    #[test]
    fn decode_target_enforces_range() {
        let p = params();
        assert!(decode_target(p.pow_limit_bits, &p).is_ok());
        // Zero target.
        assert_eq!(decode_target(0x0100_0000, &p), Err(ValidationError::BadDiffBits));
        // Above the limit.
        assert_eq!(decode_target(0x2100_ffff, &p), Err(ValidationError::BadDiffBits));
        // Negative mantissa.
        assert_eq!(decode_target(0x0180_0001, &p), Err(ValidationError::BadDiffBits));
    }

    #[test]
    fn median_time_past_window() {
        // Window shorter than 11 near genesis.
        assert_eq!(median_time_past(&[5]), 5);
        assert_eq!(median_time_past(&[1, 2, 3]), 2);
        // Unsorted input is handled; only the last 11 matter.
        let ts: Vec<u32> = (0..20).map(|i| if i % 2 == 0 { i } else { 100 - i }).collect();
        let mtp = median_time_past(&ts);
        let mut last: Vec<u32> = ts[9..].to_vec();
        last.sort_unstable();
        assert_eq!(mtp, last[last.len() / 2]);
        assert_eq!(median_time_past(&[]), 0);
    }

    #[test]
    fn contextual_rejects_old_and_future_times() {
        let p = params();
        let ctx = ContextualInfo {
            parent_height: 10,
            parent_mtp: 1_000,
            required_bits: p.pow_limit_bits,
        };
        let now = 10_000u64;
        assert!(contextual_check(1_001, p.pow_limit_bits, &ctx, now, &p).is_ok());
        assert_eq!(
            contextual_check(1_000, p.pow_limit_bits, &ctx, now, &p),
            Err(ValidationError::TimeTooOld)
        );
        let too_new = (now + MAX_FUTURE_BLOCK_TIME as u64 + 1) as u32;
        assert_eq!(
            contextual_check(too_new, p.pow_limit_bits, &ctx, now, &p),
            Err(ValidationError::TimeTooNew)
        );
        let edge = (now + MAX_FUTURE_BLOCK_TIME as u64) as u32;
        assert!(contextual_check(edge, p.pow_limit_bits, &ctx, now, &p).is_ok());
    }

    #[test]
    fn contextual_rejects_wrong_bits_and_expired_network() {
        let mut p = params();
        let ctx = ContextualInfo {
            parent_height: 10,
            parent_mtp: 1_000,
            required_bits: p.pow_limit_bits,
        };
        assert_eq!(
            contextual_check(2_000, 0x1c00ffff, &ctx, 10_000, &p),
            Err(ValidationError::BadDiffBits)
        );
        p.network_expiration_height = Some(11);
        assert_eq!(
            contextual_check(2_000, p.pow_limit_bits, &ctx, 10_000, &p),
            Err(ValidationError::NetworkExpired)
        );
    }

    #[test]
    fn anti_dos_threshold_modes() {
        let p = params();
        // IBD: the static floor.
        assert_eq!(anti_dos_work_threshold(true, None, &p), p.minimum_chain_work);
        // Steady state: tip work minus the buffer.
        let tip_work = U256::from_u64(1_000_000_000);
        let got = anti_dos_work_threshold(false, Some((tip_work, p.pow_limit_bits)), &p);
        let buffer = block_proof(p.pow_limit_bits).saturating_mul_u64(p.anti_dos_work_buffer_blocks);
        assert_eq!(got, tip_work.saturating_sub(buffer));
        // Saturation: a tiny tip cannot underflow.
        let got = anti_dos_work_threshold(false, Some((U256::ONE, p.pow_limit_bits)), &p);
        assert_eq!(got, U256::ZERO);
    }

    #[test]
    fn block_proof_monotone_in_difficulty() {
        // Harder target (smaller) means strictly more proof.
        let easy = block_proof(0x1e00ffff);
        let hard = block_proof(0x1c00ffff);
        assert!(hard > easy);
        assert!(!easy.is_zero());
        assert_eq!(block_proof(0x0100_0000), U256::ZERO);
    }

    #[test]
    fn permanence_classification() {
        assert!(ValidationError::BadPow.is_permanent());
        assert!(ValidationError::InvalidDifficulty.is_permanent());
        assert!(!ValidationError::Orphan.is_permanent());
        assert!(!ValidationError::LowWorkHeaders.is_permanent());
        assert!(!ValidationError::EpochThrottled.is_permanent());
    }
}
