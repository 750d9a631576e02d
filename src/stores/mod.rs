//! Partition lock and revocation stores (§4.4, §4.5).

pub mod partition_lock;
pub mod revocation;

pub use partition_lock::{InMemoryPartitionLockStore, PartitionLockStore};
pub use revocation::{InMemoryRevocationStore, RevocationStore};
