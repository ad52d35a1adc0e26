//! Storage layer for AlertR.
//!
//! The server core reads and writes nodes, sensors, raw sensor alerts,
//! alert levels and options through the traits in [`traits`]. The
//! in-memory backend in [`memory`] implements all of them.

pub mod memory;
pub mod traits;

pub use memory::InMemoryStorage;
pub use traits::{NodeStore, PendingAlertStore, PolicyStore, SensorStore, SensorUpdate, Storage, StorageError};
