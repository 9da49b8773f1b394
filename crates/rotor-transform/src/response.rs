use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use rotor_protocol::gemini::generate_content::response::GenerateContentResponse;
use rotor_protocol::gemini::list_models::GeminiModel;
use rotor_protocol::openai::chat_completions::response::{
    AssistantMessage, AssistantRole, ChatCompletion, ChatCompletionChoice,
    ChatCompletionObjectType, CompletionUsage, FinishReason,
};
use rotor_protocol::openai::chat_completions::stream::{
    ChatCompletionChunk, ChatCompletionChunkObjectType, ChunkChoice, ChunkDelta,
};
use rotor_protocol::openai::list_models::{ListObjectType, ModelEntry, ModelList, ModelObjectType};

/// Concatenate the text parts of the first candidate. Thought-summary
/// parts are skipped; they are not assistant output.
pub fn collect_text(response: &GenerateContentResponse) -> String {
    let Some(candidate) = response.candidates.first() else {
        return String::new();
    };
    let Some(content) = &candidate.content else {
        return String::new();
    };
    let mut text = String::new();
    for part in &content.parts {
        if part.thought.unwrap_or(false) {
            continue;
        }
        if let Some(value) = &part.text {
            text.push_str(value);
        }
    }
    text
}

/// Wrap full text into a non-streaming completion. Usage is reported as
/// zero; this proxy does not track token counts.
pub fn completion(text: impl Into<String>, model: &str) -> ChatCompletion {
    ChatCompletion {
        id: completion_id(),
        object: ChatCompletionObjectType::ChatCompletion,
        created: epoch_seconds(),
        model: model.to_string(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: AssistantRole::Assistant,
                content: text.into(),
            },
            finish_reason: FinishReason::Stop,
        }],
        usage: CompletionUsage::default(),
    }
}

/// Wrap a text fragment into one streaming delta chunk.
pub fn stream_chunk(text: impl Into<String>, model: &str) -> ChatCompletionChunk {
    make_chunk(
        model,
        ChunkDelta {
            role: Some(AssistantRole::Assistant),
            content: Some(text.into()),
        },
        None,
    )
}

/// The terminal chunk sent after the last content chunk, before `[DONE]`.
pub fn final_chunk(model: &str) -> ChatCompletionChunk {
    make_chunk(model, ChunkDelta::default(), Some(FinishReason::Stop))
}

/// Reshape the upstream model listing into the OpenAI `/models` surface.
pub fn models_to_openai(models: Vec<GeminiModel>) -> ModelList {
    let created = epoch_seconds();
    ModelList {
        object: ListObjectType::List,
        data: models
            .into_iter()
            .map(|model| ModelEntry {
                id: model
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&model.name)
                    .to_string(),
                object: ModelObjectType::Model,
                created,
                owned_by: "google".to_string(),
            })
            .collect(),
    }
}

fn make_chunk(
    model: &str,
    delta: ChunkDelta,
    finish_reason: Option<FinishReason>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: completion_id(),
        object: ChatCompletionChunkObjectType::ChatCompletionChunk,
        created: epoch_seconds(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}
