#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
pub mod config;
pub mod consts;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod installer;
pub mod logging;
pub mod prelude;
pub mod resolver;
pub mod rooms;
pub mod store;
#[cfg(test)]
mod tests;
pub mod util;
