//! Shared protocol definitions for roombridge
//!
//! Signaling messages exchanged with a room endpoint over WebSocket, and the
//! claims carried by the access token used to join a room.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
