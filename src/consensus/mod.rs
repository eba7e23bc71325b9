//! Consensus rules: network parameters, proof-of-work, difficulty schedule,
//! and header validation.

pub mod asert;
pub mod params;
pub mod pow;
pub mod randomx_vm;
pub mod validation;

pub use params::{ConsensusParams, Network};
pub use validation::{ValidationError, ValidationResult};
