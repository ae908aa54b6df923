//! # LLM Helpers
//!
//! Provider dispatch for radkit clients, written once.

/// Bind a radkit client for `$config.provider` to `$llm` and evaluate `$body`.
///
/// Must be used inside a function returning `anyhow::Result`, since client
/// construction errors are propagated with `?`.
///
/// ```rust,ignore
/// let text = with_radkit_llm!(&config, llm => {
///     let func = LlmFunction::<GeneratedText>::new_with_system_instructions(llm, system);
///     func.run(prompt).await.map_err(anyhow::Error::from)
/// })?;
/// ```
#[macro_export]
macro_rules! with_radkit_llm {
    ($config:expr, $llm:ident => $body:expr) => {{
        use radkit::models::providers::{
            AnthropicLlm, DeepSeekLlm, GeminiLlm, GrokLlm, OpenAILlm, OpenRouterLlm,
        };
        use $crate::models::LlmProvider;

        let config = $config;
        match config.provider {
            LlmProvider::Anthropic => {
                let $llm = AnthropicLlm::from_env(&config.model)?;
                $body
            }
            LlmProvider::OpenAI => {
                let $llm = match &config.base_url {
                    Some(base_url) => OpenAILlm::from_env(&config.model)?.with_base_url(base_url),
                    None => OpenAILlm::from_env(&config.model)?,
                };
                $body
            }
            LlmProvider::Gemini => {
                let $llm = GeminiLlm::from_env(&config.model)?;
                $body
            }
            LlmProvider::OpenRouter => {
                let $llm = OpenRouterLlm::from_env(&config.model)?;
                $body
            }
            LlmProvider::Grok => {
                let $llm = GrokLlm::from_env(&config.model)?;
                $body
            }
            LlmProvider::DeepSeek => {
                let $llm = DeepSeekLlm::from_env(&config.model)?;
                $body
            }
        }
    }};
}

pub use with_radkit_llm;
