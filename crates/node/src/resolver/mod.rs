#![warn(missing_docs)]
//! Per-scheme resolvers.
//!
//! Each resolver turns a parsed request into a response envelope. The
//! dispatcher owns one of each and routes by scheme; resolvers never route.

pub mod ens;
pub mod hyper;
pub mod ipfs;
