//! # Radkit Generator
//!
//! Text generation through radkit's provider clients. radkit runs its own
//! structured-output call, so this backend always answers with text and
//! never surfaces tool calls.

use anyhow::Result;
use async_trait::async_trait;
use radkit::agent::LlmFunction;
use radkit::macros::LLMOutput;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, Response, Role, TextGenerator, ToolSpec};
use crate::models::ModelConfig;
use crate::with_radkit_llm;

/// Envelope the model fills in
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct GeneratedText {
    /// The complete reply, exactly as it should be returned to the caller
    pub text: String,
}

/// [`TextGenerator`] backed by radkit providers
pub struct RadkitGenerator {
    config: ModelConfig,
}

impl RadkitGenerator {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TextGenerator for RadkitGenerator {
    async fn generate(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<Response> {
        if !tools.is_empty() {
            tracing::debug!(
                provider = self.config.provider.display_name(),
                tools = tools.len(),
                "radkit backend does not surface tool calls; answering with text"
            );
        }

        let (system, prompt) = flatten_messages(messages);
        let output: GeneratedText = with_radkit_llm!(&self.config, llm => {
            let func = LlmFunction::<GeneratedText>::new_with_system_instructions(llm, system);
            func.run(prompt).await.map_err(anyhow::Error::from)
        })?;

        Ok(Response::Text(output.text))
    }
}

/// Split a conversation into system instructions and one user prompt
fn flatten_messages(messages: &[ChatMessage]) -> (String, String) {
    let system = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();
    let prompt = match turns.as_slice() {
        [only] if only.role == Role::User => only.content.clone(),
        _ => turns
            .iter()
            .map(|m| match m.role {
                Role::User => format!("User: {}", m.content),
                Role::Assistant => format!("Assistant: {}", m.content),
                Role::Tool => format!(
                    "Tool result ({}): {}",
                    m.tool_call_id.as_deref().unwrap_or("?"),
                    m.content
                ),
                Role::System => String::new(),
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    (system, prompt)
}
