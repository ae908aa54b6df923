//! # Text Generation
//!
//! The boundary between the pipeline and whatever model produces text.
//!
//! ```text
//! Stage ──▶ RetryPolicy::run ──▶ TextGenerator::generate ──▶ Response::Text
//!                                        │                 └▶ Response::ToolCalls ──▶ run_tool_loop
//!                                        ├── OpenAiCompatClient (reqwest, tool calls)
//!                                        └── RadkitGenerator    (radkit providers, text only)
//! ```

pub mod llm_helpers;
pub mod openai_client;
pub mod radkit_client;
pub mod react;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use openai_client::OpenAiCompatClient;
pub use radkit_client::RadkitGenerator;
pub use react::{run_tool_loop, Tool, ToolBox};
pub use retry::RetryPolicy;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back with the result
    pub id: String,
    /// Tool name
    pub name: String,
    /// Raw JSON arguments as produced by the model
    pub arguments: String,
}

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls issued by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Call this tool message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant turn that requested tools
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// Result of one tool call, fed back to the model
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Tool description advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: serde_json::Value,
}

/// What a generation call produced, dispatched by tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

impl Response {
    /// Text payload, or an error if the model asked for tools instead
    pub fn into_text(self) -> anyhow::Result<String> {
        match self {
            Response::Text(text) => Ok(text),
            Response::ToolCalls(calls) => Err(anyhow::anyhow!(
                "expected text, model requested {} tool call(s)",
                calls.len()
            )),
        }
    }
}

/// External text-generation capability
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a reply to `messages`; `tools` may be empty
    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> anyhow::Result<Response>;
}

/// Remove `<think>...</think>` blocks emitted by reasoning models
pub fn strip_think_tags(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    // ASCII lowercasing keeps byte offsets aligned with `text`
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;

    while let Some(found) = lower[pos..].find(OPEN) {
        let start = pos + found;
        let Some(end) = lower[start..].find(CLOSE) else {
            break;
        };
        out.push_str(&text[pos..start]);
        pos = start + end + CLOSE.len();
    }
    out.push_str(&text[pos..]);
    out.trim().to_string()
}

/// Slice out the outermost JSON object, tolerating code fences and chatter
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
