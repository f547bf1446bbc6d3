#![warn(missing_docs)]
//! Process-wide persistent state.
//!
//! Three JSON-backed tables (ENS cache, room ports, hyper drive log) plus the
//! long-lived swarm identity. Each table is an explicit handle constructed at
//! startup and passed by reference to the component that owns it; there are
//! no singletons. Mutations write through to disk via atomic rename.

pub mod ens_cache;
pub mod fs;
pub mod hyper_cache;
pub mod identity;
pub mod room_ports;

pub use ens_cache::EnsCache;
pub use hyper_cache::HyperCache;
pub use hyper_cache::HyperCacheEntry;
pub use identity::SwarmKeypair;
pub use room_ports::RoomPortRecord;
pub use room_ports::RoomPortTable;
