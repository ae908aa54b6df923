//! # Pipeline Configuration
//!
//! Settings for one survey run. Defaults match the production setup; any
//! field can be overridden through `SURVEY_*` environment variables (the
//! CLI loads `.env` before calling [`PipelineConfig::from_env`]).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::llm::RetryPolicy;
use crate::models::{LlmProvider, ModelConfig};

/// Configuration for the survey pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Text-generation backend selection
    pub model: ModelConfig,
    /// Maximum number of items the collector fetches
    pub max_items: usize,
    /// Risk score at or above which the grader asks the reviewer
    pub risk_threshold: f32,
    /// Approved items below which the writer warns (it still writes)
    pub min_items_for_report: usize,
    /// Write the report section by section and hand drafts to the assembler
    pub section_flow: bool,
    /// Report outline, in assembly order
    pub section_outline: Vec<String>,
    /// Retrieval depth per knowledge query while writing a section
    pub section_rag_top_k: usize,
    /// Target length per section, passed to the prompt
    pub section_min_words: usize,
    /// Depth hint passed to the prompt ("brief", "detailed", "in-depth")
    pub section_detail_level: String,
    /// Sections drafted concurrently (1 keeps earlier sections visible as context)
    pub section_concurrency: usize,
    /// Let the writer call tools (ReAct loop) while drafting sections
    pub writer_use_tools: bool,
    /// Upper bound on tool-call rounds per section
    pub max_tool_turns: usize,
    /// Run the final polish pass in the assembler
    pub polish_final_report: bool,
    /// Retry policy for every text-generation call
    pub retry: RetryPolicy,
    /// Root of all on-disk caches and outputs
    pub cache_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            max_items: 50,
            risk_threshold: 4.0,
            min_items_for_report: 5,
            section_flow: true,
            section_outline: default_outline(),
            section_rag_top_k: 5,
            section_min_words: 3000,
            section_detail_level: "detailed".to_string(),
            section_concurrency: 1,
            writer_use_tools: false,
            max_tool_turns: 10,
            polish_final_report: true,
            retry: RetryPolicy::default(),
            cache_dir: PathBuf::from("./cache"),
        }
    }
}

fn default_outline() -> Vec<String> {
    [
        "Introduction and Background",
        "Theoretical Foundations and Paradigm Shifts",
        "Task Domains",
        "Environments and Frameworks",
        "Challenges and Future Directions",
        "Conclusion",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl PipelineConfig {
    /// Defaults overlaid with `SURVEY_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (testable without touching the process env)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(provider) = lookup("SURVEY_PROVIDER").and_then(|p| LlmProvider::parse(&p)) {
            config.model.model = provider.default_model().to_string();
            config.model.provider = provider;
        }
        if let Some(model) = lookup("SURVEY_MODEL") {
            config.model.model = model;
        }
        if let Some(base_url) = lookup("SURVEY_BASE_URL") {
            config.model.base_url = Some(base_url);
        }

        set_parsed(&lookup, "SURVEY_MAX_ITEMS", &mut config.max_items);
        set_parsed(&lookup, "SURVEY_RISK_THRESHOLD", &mut config.risk_threshold);
        set_parsed(&lookup, "SURVEY_MIN_ITEMS_FOR_REPORT", &mut config.min_items_for_report);
        set_parsed(&lookup, "SURVEY_SECTION_FLOW", &mut config.section_flow);
        set_parsed(&lookup, "SURVEY_SECTION_RAG_TOP_K", &mut config.section_rag_top_k);
        set_parsed(&lookup, "SURVEY_SECTION_MIN_WORDS", &mut config.section_min_words);
        set_parsed(&lookup, "SURVEY_SECTION_CONCURRENCY", &mut config.section_concurrency);
        set_parsed(&lookup, "SURVEY_WRITER_USE_TOOLS", &mut config.writer_use_tools);
        set_parsed(&lookup, "SURVEY_MAX_TOOL_TURNS", &mut config.max_tool_turns);
        set_parsed(&lookup, "SURVEY_POLISH_FINAL_REPORT", &mut config.polish_final_report);
        set_parsed(&lookup, "SURVEY_RETRY_MAX_ATTEMPTS", &mut config.retry.max_attempts);
        set_parsed(&lookup, "SURVEY_RETRY_BASE_DELAY_MS", &mut config.retry.base_delay_ms);

        if let Some(level) = lookup("SURVEY_SECTION_DETAIL_LEVEL") {
            config.section_detail_level = level;
        }
        if let Some(outline) = lookup("SURVEY_SECTION_OUTLINE") {
            let sections: Vec<String> = outline
                .split('|')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !sections.is_empty() {
                config.section_outline = sections;
            }
        }
        if let Some(dir) = lookup("SURVEY_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }

        config.section_concurrency = config.section_concurrency.max(1);
        config
    }

    /// Where item searches are cached
    pub fn items_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("items")
    }

    /// Where final reports are written
    pub fn reports_dir(&self) -> PathBuf {
        self.cache_dir.join("reports")
    }

    /// SQLite file backing the knowledge store
    pub fn knowledge_db_path(&self) -> PathBuf {
        self.cache_dir.join("knowledge").join("knowledge.db")
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable setting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_items, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.max_tool_turns, 10);
        assert_eq!(config.section_outline.len(), 6);
        assert!(config.section_flow);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SURVEY_PROVIDER", "openai"),
            ("SURVEY_BASE_URL", "http://localhost:8000/v1"),
            ("SURVEY_MAX_ITEMS", "7"),
            ("SURVEY_SECTION_OUTLINE", "Intro | Body |"),
            ("SURVEY_SECTION_CONCURRENCY", "0"),
            ("SURVEY_RISK_THRESHOLD", "not-a-number"),
        ]);
        let config = PipelineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.model.provider, LlmProvider::OpenAI);
        assert_eq!(config.model.model, "gpt-4o");
        assert_eq!(config.model.base_url.as_deref(), Some("http://localhost:8000/v1"));
        assert_eq!(config.max_items, 7);
        assert_eq!(config.section_outline, vec!["Intro", "Body"]);
        assert_eq!(config.section_concurrency, 1);
        assert_eq!(config.risk_threshold, 4.0);
    }

    #[test]
    fn test_derived_paths() {
        let config = PipelineConfig {
            cache_dir: PathBuf::from("/tmp/survey"),
            ..PipelineConfig::default()
        };
        assert_eq!(config.reports_dir(), PathBuf::from("/tmp/survey/reports"));
        assert!(config.knowledge_db_path().ends_with("knowledge/knowledge.db"));
    }
}
