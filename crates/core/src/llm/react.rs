//! # Tool Loop
//!
//! ReAct-style loop: while the model answers with tool calls, run them and
//! feed the results back, up to a fixed number of rounds.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{strip_think_tags, ChatMessage, Response, TextGenerator, ToolCall, ToolSpec};

/// A tool the model may call
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object
    fn parameters(&self) -> serde_json::Value;
    /// Execute with parsed arguments, returning text for the model
    async fn call(&self, args: serde_json::Value) -> Result<String>;
}

/// The set of tools offered during one loop
#[derive(Clone, Default)]
pub struct ToolBox {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Run one call; failures become text the model can read
    async fn execute(&self, call: &ToolCall) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name() == call.name) else {
            tracing::warn!(tool = %call.name, "Model requested unknown tool");
            return format!("tool {} not found", call.name);
        };

        let args: serde_json::Value = serde_json::from_str(&call.arguments).unwrap_or_default();
        tracing::info!(tool = %call.name, "Calling tool");

        match tool.call(args).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool call failed");
                format!("tool {} failed: {}", call.name, e)
            }
        }
    }
}

/// Drive `generator` through tool calls until it answers with text.
///
/// Returns the final text with think tags removed. Errors if the model is
/// still asking for tools after `max_turns` rounds, so callers can fall back
/// to a plain generation.
pub async fn run_tool_loop(
    generator: &dyn TextGenerator,
    mut messages: Vec<ChatMessage>,
    tools: &ToolBox,
    max_turns: usize,
    cancel: &CancellationToken,
) -> Result<String> {
    let specs = tools.specs();
    let mut response = generate_or_cancel(generator, &messages, &specs, cancel).await?;
    let mut turn = 0;

    loop {
        let calls = match response {
            Response::Text(text) => return Ok(strip_think_tags(&text)),
            Response::ToolCalls(calls) => calls,
        };

        if turn >= max_turns {
            return Err(anyhow!("tool loop exceeded {} turns", max_turns));
        }
        if cancel.is_cancelled() {
            return Err(anyhow!("tool loop cancelled"));
        }
        turn += 1;
        tracing::info!(turn, max_turns, calls = calls.len(), "Model requested tools");

        messages.push(ChatMessage::assistant_tool_calls(calls.clone()));
        for call in &calls {
            let output = tools.execute(call).await;
            messages.push(ChatMessage::tool_result(&call.id, output));
        }

        response = generate_or_cancel(generator, &messages, &specs, cancel).await?;
    }
}

async fn generate_or_cancel(
    generator: &dyn TextGenerator,
    messages: &[ChatMessage],
    specs: &[ToolSpec],
    cancel: &CancellationToken,
) -> Result<Response> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow!("tool loop cancelled")),
        result = generator.generate(messages, specs) => result,
    }
}
