use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cronkeeper_agent::{ChatRequest, LlmProvider};
use tracing::debug;

use super::Executor;
use crate::types::{RunResult, Task, TaskParams, TaskType};

pub const SYSTEM_PROMPT: &str = "You are a helpful assistant executing scheduled tasks.";

const MAX_TOKENS: u32 = 2000;

/// Sends `ai` task prompts to the configured generation provider.
pub struct AiExecutor {
    provider: Option<Arc<dyn LlmProvider>>,
    default_model: String,
}

impl AiExecutor {
    pub fn new(provider: Option<Arc<dyn LlmProvider>>, default_model: String) -> Self {
        Self {
            provider,
            default_model,
        }
    }
}

#[async_trait]
impl Executor for AiExecutor {
    fn kind(&self) -> TaskType {
        TaskType::Ai
    }

    async fn run(&self, task: &Task, timeout: Duration) -> RunResult {
        let TaskParams::Ai(params) = &task.params else {
            return RunResult::failure("not an ai task");
        };
        let Some(provider) = &self.provider else {
            return RunResult::failure(
                "no generation provider configured (set OPENAI_API_KEY or ai.api_key)",
            );
        };

        let model = params.model.as_deref().unwrap_or(&self.default_model);
        let req = ChatRequest::single_turn(model, SYSTEM_PROMPT, params.prompt.as_str(), MAX_TOKENS);
        debug!(task_id = %task.id, provider = provider.name(), model, "ai request");

        match tokio::time::timeout(timeout, provider.send(&req)).await {
            Ok(Ok(resp)) => RunResult::success(resp.content),
            Ok(Err(e)) => RunResult::failure(format!("{} request failed: {e}", provider.name())),
            Err(_) => RunResult::timeout(timeout),
        }
    }
}
