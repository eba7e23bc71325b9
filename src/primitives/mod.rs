//! Fixed-width primitive types shared by consensus and networking.

pub mod hash;
pub mod u256;
pub mod u512;

pub use hash::{double_sha256, Hash160, Hash256};
pub use u256::U256;
pub use u512::U512;
