//! # Retriable Calls
//!
//! Bounded exponential backoff around flaky text-generation calls.
//! Exhaustion is a value, not an error path: callers get a [`CallFailure`]
//! and turn it into a sentinel record.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{extract_json_object, strip_think_tags, ChatMessage, TextGenerator};
use crate::error::{truncate_chars, CallFailure};

/// Retry policy: `max_attempts` tries, sleeping `base * 2^attempt` between them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Backoff base in milliseconds
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
        }
    }

    /// Sleep before retrying after `attempt` (counted from 0) failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Run `call` until `accept` takes its output or attempts run out.
    ///
    /// A transport error from `call` and a rejection from `accept` (empty or
    /// malformed output) are treated the same way. Cancellation aborts both
    /// the in-flight call and any pending backoff.
    pub async fn run<R, T, F, Fut, P>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut call: F,
        mut accept: P,
    ) -> Result<T, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
        P: FnMut(R) -> anyhow::Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(CallFailure::cancelled(attempt));
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallFailure::cancelled(attempt + 1)),
                result = call() => result,
            };

            let accepted = match outcome {
                Ok(raw) => accept(raw),
                Err(e) => Err(e),
            };

            match accepted {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(label, attempts = attempt + 1, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    tracing::warn!(
                        label,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %truncate_chars(&last_error, 200),
                        "Call failed"
                    );
                }
            }

            if attempt + 1 < max_attempts {
                let delay = self.delay_for(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CallFailure::cancelled(attempt + 1)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        tracing::error!(label, max_attempts, "Giving up after retries");
        Err(CallFailure::new(max_attempts, last_error))
    }

    /// Retried plain generation; empty output (after think tags) counts as a failure
    pub async fn generate_text(
        &self,
        label: &str,
        cancel: &CancellationToken,
        generator: &dyn TextGenerator,
        messages: &[ChatMessage],
    ) -> Result<String, CallFailure> {
        self.run(
            label,
            cancel,
            move || generator.generate(messages, &[]),
            |response| {
                let text = strip_think_tags(&response.into_text()?);
                if text.is_empty() {
                    anyhow::bail!("empty response");
                }
                Ok(text)
            },
        )
        .await
    }

    /// Retried generation of a JSON object deserialized into `T`
    pub async fn generate_json<T: DeserializeOwned>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        generator: &dyn TextGenerator,
        messages: &[ChatMessage],
    ) -> Result<T, CallFailure> {
        self.run(
            label,
            cancel,
            move || generator.generate(messages, &[]),
            |response| {
                let text = strip_think_tags(&response.into_text()?);
                parse_json_reply(&text)
            },
        )
        .await
    }
}

/// Parse the JSON object in a model reply, tolerating fences and chatter
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    let json = extract_json_object(text)
        .ok_or_else(|| anyhow::anyhow!("no JSON object in reply: {}", truncate_chars(text, 200)))?;
    serde_json::from_str(json)
        .map_err(|e| anyhow::anyhow!("malformed JSON ({}): {}", e, truncate_chars(text, 200)))
}
