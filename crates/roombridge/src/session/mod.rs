//! Concrete room sessions on top of webrtc-rs
//!
//! A session authenticates with an access token, joins the room over a JSON
//! signaling WebSocket and negotiates one peer connection. The destination
//! session implements [`crate::track::TrackPublisher`]; the source session
//! turns every remote track into an [`crate::track::InboundTrack`].

mod local;
mod remote;
mod room;
mod signaling;
pub mod token;

pub use room::{Role, RoomSession};
pub use signaling::{rtc_url, SignalingClient};
