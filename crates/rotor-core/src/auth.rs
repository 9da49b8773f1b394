use http::HeaderMap;
use http::StatusCode;
use tracing::warn;

use rotor_pool::{AccessKey, AccessKeyStore};

use crate::error::ProxyError;

pub const ACCESS_KEY_PREFIX: &str = "sk-";

/// Resolve the caller's access key from request headers. Terminal on
/// failure; a bad access key is never retried against another credential.
pub async fn authenticate(
    store: &dyn AccessKeyStore,
    headers: &HeaderMap,
) -> Result<AccessKey, ProxyError> {
    let Some(secret) = extract_api_key(headers) else {
        return Err(ProxyError::unauthorized("missing API key"));
    };
    if !secret.starts_with(ACCESS_KEY_PREFIX) {
        return Err(ProxyError::unauthorized("invalid API key"));
    }
    match store.lookup(&secret).await {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(ProxyError::unauthorized("invalid API key")),
        Err(err) => {
            warn!(event = "auth.store_failed", error = %err);
            Err(ProxyError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "access key store unavailable",
            ))
        }
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }

    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    if let Some(token) = auth.strip_prefix("Bearer ") {
        return Some(token.trim().to_string());
    }
    if let Some(token) = auth.strip_prefix("bearer ") {
        return Some(token.trim().to_string());
    }
    None
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
