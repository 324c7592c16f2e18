use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Remote track metadata announced by a room endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackInfo {
    /// Track id as it appears in the SDP msid attribute
    pub track_id: String,
    /// Human readable publication name
    pub name: String,
    /// Identity of the publishing participant
    pub participant: String,
    pub mime_type: String,
}

/// Permissions granted to the bearer of an access token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
}

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub iss: String, // API key
    pub sub: String, // Participant identity
    pub name: String,
    pub nbf: i64,
    pub exp: i64,
    pub video: VideoGrant,
}

impl AccessClaims {
    pub fn new(
        api_key: &str,
        identity: &str,
        name: &str,
        grant: VideoGrant,
        expires_in_hours: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            iss: api_key.to_string(),
            sub: identity.to_string(),
            name: name.to_string(),
            nbf: now.timestamp(),
            exp: (now + Duration::hours(expires_in_hours)).timestamp(),
            video: grant,
        }
    }
}

/// Build a participant identity that is unique per process run
pub fn participant_identity(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}
