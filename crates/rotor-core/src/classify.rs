//! Upstream failure classification.
//!
//! Gemini reports most problems as free-text messages, so the dispatch
//! layer pattern-matches error text (and the HTTP status when one exists)
//! into a small category table. All matching rules live here; nothing
//! elsewhere inspects error strings.

/// One failed upstream call. `status` is present for HTTP-level failures
/// and absent for transport errors (connect, DNS, timeout, broken stream).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn empty_response() -> Self {
        Self::transport("empty response from upstream")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Quota or rate limit exhausted for this key.
    Quota,
    /// The key itself was rejected; the credential should leave rotation.
    InvalidKey,
    /// Unknown model or endpoint.
    NotFound,
    /// Upstream answered but produced no usable content.
    EmptyResponse,
    /// Explicit 401 with no key-related hint. Caller-side, terminal.
    Unauthorized,
    /// Explicit 403 with no key-related hint. Caller-side, terminal.
    Forbidden,
    /// Connect, DNS, timeout, or broken-stream failure before an HTTP
    /// status existed.
    Network,
    /// Anything else: server errors, unclassified text.
    Other,
}

/// Message patterns take precedence over the raw HTTP status: a 401 whose
/// body says `API_KEY_INVALID` is a bad key (retryable with the next key),
/// not a caller authentication problem.
pub fn classify(error: &UpstreamError) -> ErrorCategory {
    let message = error.message.as_str();
    if message.to_ascii_lowercase().contains("quota") {
        return ErrorCategory::Quota;
    }
    if message.contains("API_KEY_INVALID") || message.contains("Invalid API key") {
        return ErrorCategory::InvalidKey;
    }
    if message.contains("Not Found") {
        return ErrorCategory::NotFound;
    }
    if message.contains("empty response") {
        return ErrorCategory::EmptyResponse;
    }
    match error.status {
        Some(401) => ErrorCategory::Unauthorized,
        Some(403) if !has_key_hint(message) => ErrorCategory::Forbidden,
        Some(_) => ErrorCategory::Other,
        None => ErrorCategory::Network,
    }
}

fn has_key_hint(message: &str) -> bool {
    message.contains("API key") || message.contains("API_KEY")
}

impl ErrorCategory {
    /// HTTP-style status recorded on the attempt log entry.
    pub fn status_class(self) -> u16 {
        match self {
            ErrorCategory::Quota => 429,
            ErrorCategory::InvalidKey | ErrorCategory::Unauthorized => 401,
            ErrorCategory::NotFound => 404,
            ErrorCategory::EmptyResponse => 502,
            ErrorCategory::Forbidden => 403,
            ErrorCategory::Network | ErrorCategory::Other => 500,
        }
    }

    /// Whether the next credential may be tried. Only caller-side auth and
    /// permission failures recur identically across keys; everything else
    /// is key-specific or transient.
    pub fn retryable(self) -> bool {
        !matches!(self, ErrorCategory::Unauthorized | ErrorCategory::Forbidden)
    }

    /// Whether the failing credential should be dropped from rotation.
    pub fn invalidates_credential(self) -> bool {
        matches!(self, ErrorCategory::InvalidKey)
    }
}
