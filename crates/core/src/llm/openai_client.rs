//! # OpenAI-Compatible Client
//!
//! Chat completions over HTTP for OpenAI and the many endpoints that copy
//! its wire format. Unlike the radkit backend, tool calls are returned to
//! the caller so the pipeline can run its own tool loop.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatMessage, Response, Role, TextGenerator, ToolCall, ToolSpec};
use crate::models::ModelConfig;

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// [`TextGenerator`] speaking the OpenAI chat-completions protocol
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: OPENAI_API_URL.to_string(),
            model: model.into(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Key from `SURVEY_API_KEY`, falling back to `OPENAI_API_KEY`
    pub fn from_env(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var("SURVEY_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .context("Set SURVEY_API_KEY or OPENAI_API_KEY for the OpenAI-compatible backend")?;
        let client = Self::new(api_key, &config.model)?;
        Ok(match &config.base_url {
            Some(url) => client.with_base_url(url),
            None => client,
        })
    }

    fn build_request<'a>(&'a self, messages: &[ChatMessage], tools: &[ToolSpec]) -> WireRequest<'a> {
        let tools: Vec<WireTool> = tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect();
        let tool_choice = (!tools.is_empty()).then_some("auto");

        WireRequest {
            model: &self.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            tools,
            tool_choice,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatClient {
    async fn generate(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self.build_request(messages, tools);

        tracing::debug!(model = %self.model, messages = messages.len(), tools = tools.len(), "Chat request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Chat completion request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Chat API error ({}): {}", status, error_text));
        }

        let body: WireResponse = response
            .json()
            .await
            .context("Malformed chat completion response")?;
        into_response(body)
    }
}

fn into_response(body: WireResponse) -> Result<Response> {
    let message = body
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| anyhow!("No choices in response"))?;

    match message.tool_calls {
        Some(calls) if !calls.is_empty() => Ok(Response::ToolCalls(
            calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
        )),
        _ => message
            .content
            .map(Response::Text)
            .ok_or_else(|| anyhow!("Response carried neither content nor tool calls")),
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: Role,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        let tool_calls = (!msg.tool_calls.is_empty()).then(|| {
            msg.tool_calls
                .iter()
                .map(|c| WireToolCall {
                    id: c.id.clone(),
                    kind: "function".to_string(),
                    function: WireFunctionCall {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    },
                })
                .collect()
        });
        Self {
            role: msg.role,
            content: Some(msg.content.clone()),
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}
