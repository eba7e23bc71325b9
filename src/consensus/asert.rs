//! ASERT: absolutely scheduled exponentially rising targets.
//!
//! Per-block retarget. The target for the next block is the anchor's target
//! scaled by `2^((time_drift - ideal_drift) / half_life)`, where drift is
//! measured from the anchor's schedule origin. The fractional power of two
//! is approximated with a cubic fixed-point polynomial; the established
//! constants are consensus and must not change.
//!
//! Every precondition here is enforced unconditionally. A violated contract
//! returns `InvalidDifficulty` — never a debug-only assertion, never
//! undefined behavior.

use crate::consensus::params::ConsensusParams;
use crate::consensus::validation::ValidationError;
use crate::primitives::{U256, U512};

/// Cubic coefficients for `2^(frac/65536)`, 48-bit fixed point.
const POLY_A: u128 = 195_766_423_245_049;
const POLY_B: u128 = 971_821_376;
const POLY_C: u128 = 5_127;

/// Retarget inputs taken from the anchor block. `prev_time` is the timestamp
/// of the anchor's *parent*, which defines the schedule origin.
#[derive(Debug, Clone, Copy)]
pub struct AsertAnchor {
    pub height: u64,
    pub bits: u32,
    pub prev_time: u32,
}

/// Computes the required target for the block whose parent is
/// (`parent_height`, `parent_time`).
pub fn next_required_target(
    anchor: &AsertAnchor,
    parent_height: u64,
    parent_time: u32,
    params: &ConsensusParams,
) -> Result<U256, ValidationError> {
    let ref_target = U256::from_compact(anchor.bits).ok_or(ValidationError::InvalidDifficulty)?;
    if ref_target.is_zero() || ref_target > params.pow_limit {
        return Err(ValidationError::InvalidDifficulty);
    }
    if params.asert_half_life <= 0 {
        return Err(ValidationError::InvalidDifficulty);
    }
    let height_diff = parent_height
        .checked_sub(anchor.height)
        .ok_or(ValidationError::InvalidDifficulty)?;

    let time_diff = parent_time as i128 - anchor.prev_time as i128;
    let ideal = params.pow_target_spacing as i128 * (height_diff as i128 + 1);
    let drift = time_diff - ideal;

    // The 16.16 exponent must fit an i64 once scaled; anything larger is a
    // corrupt input, not a schedule.
    if drift.unsigned_abs() > (i64::MAX as u128) / 65536 {
        return Err(ValidationError::InvalidDifficulty);
    }
    let exponent = (drift * 65536).div_euclid(params.asert_half_life as i128);

    // Split into whole shifts and a 16-bit fraction; `div_euclid` above and
    // the arithmetic shift here both round toward negative infinity, so the
    // fraction is always in [0, 65536).
    let shifts = exponent >> 16;
    let frac = (exponent & 0xffff) as u128;
    debug_assert!((shifts << 16) + frac as i128 == exponent);

    let factor =
        65536 + ((POLY_A * frac + POLY_B * frac * frac + POLY_C * frac * frac * frac + (1 << 47))
            >> 48);
    let widened = U512::from_u256(ref_target).mul_u64(factor as u64);

    // `factor` carries a 2^16 scale; fold it into the shift count.
    let total_shift = shifts - 16;
    let shifted = if total_shift >= 512 {
        return Ok(params.pow_limit);
    } else if total_shift <= -512 {
        return Ok(U256::ONE);
    } else if total_shift >= 0 {
        widened.shl(total_shift as u32)
    } else {
        widened.shr((-total_shift) as u32)
    };

    let mut next = shifted.to_u256_saturating();
    if next.is_zero() {
        next = U256::ONE;
    }
    if next > params.pow_limit {
        next = params.pow_limit;
    }
    Ok(next)
}

/// Compact-form convenience wrapper around [`next_required_target`].
pub fn next_required_bits(
    anchor: &AsertAnchor,
    parent_height: u64,
    parent_time: u32,
    params: &ConsensusParams,
) -> Result<u32, ValidationError> {
    next_required_target(anchor, parent_height, parent_time, params).map(U256::to_compact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::Network;

    fn schedule_params() -> ConsensusParams {
        let mut p = ConsensusParams::for_network(Network::Main);
        p.pow_target_spacing = 3600;
        p.asert_half_life = 172800;
        p
    }

    fn anchor(params: &ConsensusParams) -> AsertAnchor {
        AsertAnchor {
            height: 1,
            bits: params.pow_limit_bits,
            prev_time: 10_000,
        }
    }

    #[test]
    fn on_schedule_target_is_unchanged() {
        let params = schedule_params();
        let a = anchor(&params);
        // Parent is the anchor itself; the next block is exactly one spacing
        // after the schedule origin.
        let bits = next_required_bits(&a, 1, 10_000 + 3600, &params).unwrap();
        assert_eq!(bits, params.pow_limit_bits);
    }

    #[test]
    fn early_block_decreases_target() {
        let params = schedule_params();
        let a = anchor(&params);
        let target = next_required_target(&a, 1, 10_000 + 1800, &params).unwrap();
        assert!(target < params.pow_limit);
        // 2^(-1800/172800) ~= 0.9928: a sub-1% drop.
        let floor = params.pow_limit.saturating_mul_u64(98).div_rem(U256::from_u64(100)).0;
        assert!(target > floor);
    }

    #[test]
    fn late_block_clamps_at_pow_limit() {
        let params = schedule_params();
        let a = anchor(&params);
        // Already at the limit; a late block cannot rise above it.
        let target = next_required_target(&a, 1, 10_000 + 7200, &params).unwrap();
        assert_eq!(target, params.pow_limit);
    }

    #[test]
    fn late_block_increases_target_below_limit() {
        let params = schedule_params();
        let a = AsertAnchor {
            height: 1,
            bits: 0x1c0fffff, // well below the limit
            prev_time: 10_000,
        };
        let on_time = next_required_target(&a, 1, 10_000 + 3600, &params).unwrap();
        let late = next_required_target(&a, 1, 10_000 + 7200, &params).unwrap();
        assert!(late > on_time);
    }

    #[test]
    fn multiple_heights_follow_schedule() {
        let params = schedule_params();
        let a = anchor(&params);
        // Ten blocks, all exactly on schedule: target stays at the anchor's.
        for h in 1..=10u64 {
            let t = 10_000 + 3600 * (h as u32);
            let bits = next_required_bits(&a, h, t, &params).unwrap();
            assert_eq!(bits, params.pow_limit_bits, "height {h}");
        }
    }

    #[test]
    fn parent_below_anchor_is_rejected() {
        let params = schedule_params();
        let a = AsertAnchor {
            height: 5,
            bits: params.pow_limit_bits,
            prev_time: 10_000,
        };
        assert!(matches!(
            next_required_target(&a, 4, 20_000, &params),
            Err(ValidationError::InvalidDifficulty)
        ));
    }

    #[test]
    fn bad_anchor_bits_are_rejected() {
        let params = schedule_params();
        for bits in [0u32, 0x0180_0000 /* sign bit */, 0xff12_3456 /* overflow */] {
            let a = AsertAnchor {
                height: 1,
                bits,
                prev_time: 10_000,
            };
            assert!(matches!(
                next_required_target(&a, 1, 20_000, &params),
                Err(ValidationError::InvalidDifficulty)
            ));
        }
    }

    #[test]
    fn extreme_lateness_never_overflows() {
        let params = schedule_params();
        let a = anchor(&params);
        let target = next_required_target(&a, 1, u32::MAX, &params).unwrap();
        assert_eq!(target, params.pow_limit);
        // And extreme earliness floors at one.
        let a2 = AsertAnchor {
            height: 1,
            bits: params.pow_limit_bits,
            prev_time: u32::MAX,
        };
        let target = next_required_target(&a2, 1_000_000, 0, &params).unwrap();
        assert!(target >= U256::ONE);
    }
}
