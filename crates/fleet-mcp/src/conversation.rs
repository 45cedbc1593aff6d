//! Bounded LLM function-calling loop over the capability servers.

use std::sync::Arc;

use crate::llm::{ChatMessage, LlmClient};
use crate::mcp::ToolDispatcher;

pub const DEFAULT_MAX_ITERATIONS: usize = 3;
pub const MAX_ITERATIONS_MESSAGE: &str =
    "I reached the maximum number of iterations without a final answer.";

pub struct ConversationLoop {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<ToolDispatcher>,
    max_iterations: usize,
    system_prompt: Option<String>,
}

impl ConversationLoop {
    pub fn new(llm: Arc<dyn LlmClient>, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            llm,
            dispatcher,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
        }
    }

    /// Zero is treated as one round.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Always terminates with text. LLM failures become a message; tool
    /// failures are fed back to the model as `Error: ...` turns.
    pub async fn run(&self, message: &str, history: &[ChatMessage]) -> String {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(message));

        let functions = self.dispatcher.registry().function_specs().await;
        tracing::debug!(functions = functions.len(), "starting conversation");

        for round in 1..=self.max_iterations {
            let reply = match self.llm.complete(&messages, &functions).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(round, "LLM call failed: {}", e);
                    return format!("LLM request failed: {}", e);
                }
            };
            if reply.tool_calls.is_empty() {
                tracing::info!(round, "conversation finished");
                return reply.content;
            }
            tracing::info!(round, calls = reply.tool_calls.len(), "LLM requested tools");
            let calls = reply.tool_calls.clone();
            messages.push(ChatMessage::assistant(reply.content, reply.tool_calls));
            for call in calls {
                let output = self.dispatcher.dispatch(&call.name, call.arguments).await;
                messages.push(ChatMessage::tool_result(call.id, output));
            }
        }
        tracing::warn!(max = self.max_iterations, "conversation hit the iteration cap");
        MAX_ITERATIONS_MESSAGE.to_string()
    }
}
