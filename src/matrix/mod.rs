//! Matrix module: local block store, distributed block matrix and their plumbing.

pub mod block_store;
pub mod dist_block;
pub mod hash_index;
pub mod layout;
pub mod scatter;
pub mod stash;

pub use block_store::{BlockStore, NewNonzeroPolicy, CHUNK_SIZE};
pub use dist_block::{AssemblyState, DistBlockMatrix, InsertModeBits, MatInfo, MatNorm, MatOption, Prealloc};
pub use hash_index::{HashIndex, HashLookup};
pub use layout::Layout;
pub use scatter::ScatterPlan;
pub use stash::Stash;
