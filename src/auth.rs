use axum::http::HeaderMap;

use crate::config::AuthConfig;
use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Verify the request's API key against the configured set.
///
/// Returns the accepted key when auth is enabled (it doubles as the
/// rate-limit identity) and None when auth is disabled.
pub fn verify(headers: &HeaderMap, auth: &AuthConfig) -> Result<Option<String>, ApiError> {
    if !auth.enabled {
        return Ok(None);
    }
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;
    if auth.api_keys.iter().any(|key| key == presented) {
        Ok(Some(presented.to_string()))
    } else {
        Err(ApiError::unauthorized())
    }
}
