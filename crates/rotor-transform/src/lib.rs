//! Stateless translation between the OpenAI-facing wire format and the
//! Gemini upstream format, plus the text-chunking used by simulated
//! streaming. Everything here is a pure function of its input except the
//! generated completion ids, timestamps, and the optional disguise token.

pub mod chunking;
pub mod request;
pub mod response;

pub use chunking::{ChunkPolicy, split_chunks};
pub use request::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, to_gemini};
pub use response::{collect_text, completion, final_chunk, models_to_openai, stream_chunk};
