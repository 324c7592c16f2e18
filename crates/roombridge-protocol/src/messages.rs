use serde::{Deserialize, Serialize};

use crate::types::TrackInfo;

/// Messages sent from the bridge to a room endpoint via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the room named in the access token
    Join {
        room: String,
        identity: String,
        name: String,
    },

    /// Announce a local track before the offer that carries it
    AddTrack {
        track_id: String,
        name: String,
        mime_type: String,
    },

    /// WebRTC offer (publishing side)
    Offer { sdp: String },

    /// WebRTC answer (subscribing side)
    Answer { sdp: String },

    /// WebRTC ICE candidate
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },

    /// Leave the room
    Leave,

    /// Ping to keep connection alive
    Ping,
}

/// Messages sent from a room endpoint to the bridge via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted
    Joined {
        room: String,
        participant_sid: String,
    },

    /// Error message
    Error { message: String },

    /// Pong response to ping
    Pong,

    /// WebRTC offer from the room (new subscriptions)
    Offer { sdp: String },

    /// WebRTC answer to a publishing offer
    Answer { sdp: String },

    /// WebRTC ICE candidate from the room
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },

    /// A remote track is about to be delivered through the subscriber connection
    TrackPublished { track: TrackInfo },

    /// The room asked us to leave
    Leave { reason: Option<String> },
}
