use rand::Rng;

use rotor_protocol::gemini::generate_content::request::GenerateContentRequestBody;
use rotor_protocol::gemini::generate_content::types::{Content, ContentRole, GenerationConfig, Part};
use rotor_protocol::openai::chat_completions::request::{ChatCompletionRequestBody, ChatRole};

pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Marker prepended when a system message is folded into a user turn;
/// Gemini has no system role.
const SYSTEM_PREFIX: &str = "System: ";

const DISGUISE_TOKEN_LEN: usize = 6;

/// Convert an OpenAI chat-completions request into a Gemini
/// generate-content body.
///
/// Role mapping: `system` folds into a `user` turn prefixed with
/// `"System: "`, `user` stays `user`, `assistant` becomes `model`. When
/// `disguise` is set, a short random token is appended to the first
/// user-role message (and only that one) to defeat upstream response
/// caching.
pub fn to_gemini(request: &ChatCompletionRequestBody, disguise: bool) -> GenerateContentRequestBody {
    let mut token = if disguise {
        Some(disguise_token())
    } else {
        None
    };

    let mut contents = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        let (role, text) = match message.role {
            ChatRole::System => (
                ContentRole::User,
                format!("{SYSTEM_PREFIX}{}", message.content),
            ),
            ChatRole::User => {
                let text = match token.take() {
                    Some(token) => format!("{} [{token}]", message.content),
                    None => message.content.clone(),
                };
                (ContentRole::User, text)
            }
            ChatRole::Assistant => (ContentRole::Model, message.content.clone()),
        };
        contents.push(Content {
            parts: vec![Part::text(text)],
            role: Some(role),
        });
    }

    GenerateContentRequestBody {
        contents,
        generation_config: Some(GenerationConfig {
            max_output_tokens: Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
            temperature: Some(request.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
        }),
    }
}

fn disguise_token() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..DISGUISE_TOKEN_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}
