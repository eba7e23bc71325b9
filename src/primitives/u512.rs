//! 512-bit unsigned intermediate used by the difficulty schedule.
//!
//! Only the operations the exponential retarget needs: widening from a
//! target, multiply by a small factor, shifts, and clamped truncation back
//! to 256 bits. Eight little-endian `u64` limbs.

use super::u256::U256;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct U512([u64; 8]);

impl U512 {
    pub const ZERO: U512 = U512([0; 8]);

    pub fn from_u256(v: U256) -> Self {
        let limbs = v.to_limbs();
        let mut out = [0u64; 8];
        out[..4].copy_from_slice(&limbs);
        U512(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|l| *l == 0)
    }

    /// Multiply by a 64-bit factor, saturating past 512 bits. The retarget
    /// path multiplies a 256-bit target by a 17-bit factor, which stays far
    /// below the saturation point.
    pub fn mul_u64(self, rhs: u64) -> Self {
        let mut out = [0u64; 8];
        let mut carry: u128 = 0;
        for i in 0..8 {
            let prod = self.0[i] as u128 * rhs as u128 + carry;
            out[i] = prod as u64;
            carry = prod >> 64;
        }
        if carry != 0 {
            return U512([u64::MAX; 8]);
        }
        U512(out)
    }

    pub fn shl(self, shift: u32) -> Self {
        if shift >= 512 {
            return U512::ZERO;
        }
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        let mut out = [0u64; 8];
        for i in (limb_shift..8).rev() {
            let src = i - limb_shift;
            out[i] = self.0[src] << bit_shift;
            if bit_shift > 0 && src > 0 {
                out[i] |= self.0[src - 1] >> (64 - bit_shift);
            }
        }
        U512(out)
    }

    pub fn shr(self, shift: u32) -> Self {
        if shift >= 512 {
            return U512::ZERO;
        }
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        let mut out = [0u64; 8];
        for i in 0..(8 - limb_shift) {
            let src = i + limb_shift;
            out[i] = self.0[src] >> bit_shift;
            if bit_shift > 0 && src + 1 < 8 {
                out[i] |= self.0[src + 1] << (64 - bit_shift);
            }
        }
        U512(out)
    }

    /// True when any bit above the low 256 is set.
    pub fn overflows_u256(&self) -> bool {
        self.0[4..].iter().any(|l| *l != 0)
    }

    /// Truncate to 256 bits, saturating when the value does not fit.
    pub fn to_u256_saturating(self) -> U256 {
        if self.overflows_u256() {
            return U256::MAX;
        }
        let mut limbs = [0u64; 4];
        limbs.copy_from_slice(&self.0[..4]);
        U256::from_limbs(limbs)
    }
}
