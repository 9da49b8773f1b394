pub mod chat_completions;
pub mod error;
pub mod list_models;
