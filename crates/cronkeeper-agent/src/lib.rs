//! Text-generation providers used by `ai` tasks.

pub mod openai;
pub mod provider;

pub use openai::OpenAiProvider;
pub use provider::{ChatRequest, ChatResponse, LlmProvider, Message, ProviderError, Role};
