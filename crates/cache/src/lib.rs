//! mirra cache: supervised watches feeding an in-memory, eventually
//! consistent mirror of the cluster.
//!
//! One bucket per watched type key. Each bucket owns its identity map and is
//! the only writer to it; readers get lock-free point-in-time snapshots.
//! Reads never block on the network. Callers that need definite freshness
//! pair a read with [`InstanceCacheManager::wait_ready`].

#![forbid(unsafe_code)]

pub mod bucket;
pub mod catalog;
pub mod manager;
pub mod supervisor;

pub use catalog::{NamespaceCatalog, TypeCatalog};
pub use manager::{ChangeNotifier, InstanceCacheManager};
