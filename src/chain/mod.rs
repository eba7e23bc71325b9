//! Chain state: the block-index tree, the active chain, candidate tips,
//! the orphan pool, and the manager that ties them into consensus.

pub mod chainstate;
pub mod index;
pub mod orphans;
pub mod selector;
pub mod store;

pub use chainstate::{ActivateError, Chainstate, ChainstateConfig};
pub use index::{BlockIndexNode, BlockStatus, NodeId};
pub use store::{BlockStore, StoreError};
