use roombridge_media::{ReassemblyError, VideoCodec};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to sign access token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Invalid signaling message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Room rejected the session: {0}")]
    Rejected(String),

    #[error("Signaling connection closed")]
    Closed,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Why reading from an inbound track stopped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("End of stream")]
    EndOfStream,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Failure of a single relay worker. Never fatal to other workers.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to publish track {track} ({codec}): {source}")]
    Publish {
        track: String,
        codec: VideoCodec,
        source: anyhow::Error,
    },

    #[error("Failed to read from track {track} ({codec}): {reason}")]
    Read {
        track: String,
        codec: VideoCodec,
        reason: String,
    },

    #[error("Failed to write frame to track {track} ({codec}): {source}")]
    Write {
        track: String,
        codec: VideoCodec,
        source: anyhow::Error,
    },

    #[error("Relay worker for track {track} aborted: {reason}")]
    Aborted { track: String, reason: String },

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
}
