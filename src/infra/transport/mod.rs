//! Peer transports carrying relay frames.

pub mod hub;
pub mod local;
pub mod ws;

pub use hub::{Hub, Relay};
pub use local::{LocalInbox, LocalPeer};
pub use ws::{WsPeer, ws_handler};
