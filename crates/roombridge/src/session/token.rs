use jsonwebtoken::{encode, EncodingKey, Header};

use crate::error::SessionError;
use roombridge_protocol::{AccessClaims, VideoGrant};

/// Lifetime of an access token
pub const TOKEN_TTL_HOURS: i64 = 6;

pub fn access_token(
    api_key: &str,
    api_secret: &str,
    identity: &str,
    name: &str,
    grant: VideoGrant,
) -> Result<String, SessionError> {
    let claims = AccessClaims::new(api_key, identity, name, grant, TOKEN_TTL_HOURS);

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(api_secret.as_bytes()),
    )?;

    Ok(token)
}
