//! 256/160-bit hashes and double-SHA256.
//!
//! Storage keeps the raw digest byte order (the order bytes travel on the
//! wire). The external/display form reverses the bytes, so the hex string a
//! user sees is the big-endian number a target comparison uses.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::u256::U256;

/// SHA256(SHA256(data)).
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

macro_rules! impl_fixed_hash {
    ($name:ident, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;
            pub const ZERO: $name = $name([0u8; $len]);

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_bytes(self) -> [u8; $len] {
                self.0
            }

            /// All-zero value, used as the null previous-hash of genesis.
            pub fn is_null(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                if slice.len() != $len {
                    return None;
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(slice);
                Some(Self(out))
            }

            /// Display-order hex (reversed relative to storage).
            pub fn to_hex(&self) -> String {
                let mut rev = self.0;
                rev.reverse();
                hex::encode(rev)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s)?;
                if bytes.len() != $len {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(&bytes);
                out.reverse();
                Ok(Self(out))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

impl_fixed_hash!(Hash256, 32);
impl_fixed_hash!(Hash160, 20);

impl Hash256 {
    /// Numeric value for target comparisons (storage order is little-endian).
    pub fn to_u256(&self) -> U256 {
        U256::from_le_bytes(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_sha256_matches_known_vector() {
        // SHA256d("hello") — independently computed.
        let h = double_sha256(b"hello");
        assert_eq!(
            hex::encode(h),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn display_reverses_storage_order() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xaa;
        bytes[31] = 0x11;
        let h = Hash256::new(bytes);
        let s = h.to_hex();
        assert!(s.starts_with("11"));
        assert!(s.ends_with("aa"));
    }

    #[test]
    fn from_str_round_trips() {
        let s = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let h: Hash256 = s.parse().unwrap();
        assert_eq!(h.to_hex(), s);
        // Leading zeros in display order mean trailing zeros in storage.
        assert_eq!(h.0[31], 0);
        assert_eq!(h.0[28], 0);
    }

    #[test]
    fn null_hash_detection() {
        assert!(Hash256::ZERO.is_null());
        let mut b = [0u8; 32];
        b[7] = 1;
        assert!(!Hash256::new(b).is_null());
    }

    #[test]
    fn hash160_len_enforced() {
        assert!(Hash160::from_slice(&[0u8; 19]).is_none());
        assert!(Hash160::from_slice(&[0u8; 20]).is_some());
    }
}
