//! Storage abstractions and the in-memory reference backend.
//!
//! The engine is storage-agnostic: it only sees the traits re-exported here.

mod memory;
mod traits;

pub use memory::{InMemoryInventoryStore, InMemoryInventoryTx, InMemoryKeyValueStore};
pub use traits::{InventoryStore, InventoryTx, KeyValueStore, StorageError};
