//! ccdindex-storage: pluggable storage backends for ccdindex.
//!
//! Backends:
//! - [`memory`]: in-memory store cache and checkpoints (dev/testing, no persistence)

pub mod memory;

pub use memory::InMemoryStore;
