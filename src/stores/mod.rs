//! Store backends.
//!
//! Concrete [`SessionStore`](crate::SessionStore) implementations. The
//! in-memory store is always available; others sit behind feature gates:
//!
//! | Feature      | Store                       |
//! |--------------|-----------------------------|
//! | (always)     | [`MemoryStore`]             |
//! | `store-rest` | [`rest::RestStore`]         |

pub mod memory;

#[cfg(feature = "store-rest")]
pub mod rest;

pub use memory::MemoryStore;

#[cfg(feature = "store-rest")]
pub use rest::{RestStore, RestStoreConfig};
