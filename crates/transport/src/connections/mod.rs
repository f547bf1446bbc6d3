//! Transport implementations.
//!
//! Real stacks live in the host application. This crate only ships the
//! in-memory `MemoryNetwork` / `MemoryTunnel` / `MemoryFetcher` trio behind
//! the `dummy` feature, used for testing and for running the gateway without
//! a wired-in stack.

#[cfg(feature = "dummy")]
pub mod memory;

#[cfg(feature = "dummy")]
pub use crate::connections::memory::MemoryFetcher;
#[cfg(feature = "dummy")]
pub use crate::connections::memory::MemoryNetwork;
#[cfg(feature = "dummy")]
pub use crate::connections::memory::MemoryTunnel;
