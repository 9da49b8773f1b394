use serde::{Deserialize, Serialize};

/// Error envelope returned by the Gemini API on non-2xx responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeminiErrorResponse {
    #[serde(default)]
    pub error: GeminiErrorDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeminiErrorDetail {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl GeminiErrorResponse {
    /// Best-effort extraction of the upstream error message from a raw body.
    /// Falls back to the body text itself when it is not the JSON envelope.
    pub fn message_from_body(body: &[u8]) -> String {
        if let Ok(parsed) = serde_json::from_slice::<GeminiErrorResponse>(body)
            && !parsed.error.message.is_empty()
        {
            return parsed.error.message;
        }
        String::from_utf8_lossy(body).trim().to_string()
    }
}
