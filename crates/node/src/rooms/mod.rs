#![warn(missing_docs)]
//! The hs:// realtime room service and the hyper-chat companion mode.
//!
//! A room is a tiny local HTTP+SSE document server fronted by a published
//! tunnel. The tunnel key is the room's public identity; the port table in
//! [crate::store::room_ports] lets the creator re-host under the same key
//! after a restart.

pub mod chat;
pub mod http;
pub mod service;
pub mod session;

pub use chat::ChatService;
pub use service::RoomService;
