//! # Analyzer Stage
//!
//! Deepens each summary with context from similar documents already in
//! the knowledge store and extracts the key concepts the grader scores.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::truncate_chars;
use crate::llm::{ChatMessage, RetryPolicy, TextGenerator};
use crate::memory::{metadata, KnowledgeStore, Metadata};
use crate::skills::prompts::{self, KEY_CONCEPTS_PREFIX};
use crate::swarm::bus::{Handler, HandlerContext};
use crate::swarm::messages::{AnalysisRecord, Message, SummaryRecord, Topic, FAILURE_MARKER};

/// Documents fetched as context
const SIMILAR_FETCHED: usize = 3;
/// Documents actually quoted in the prompt
const SIMILAR_USED: usize = 2;
const SNIPPET_CHARS: usize = 100;
const MAX_KEY_CONCEPTS: usize = 5;

pub struct AnalyzerStage {
    generator: Arc<dyn TextGenerator>,
    knowledge: KnowledgeStore,
    retry: RetryPolicy,
}

impl AnalyzerStage {
    pub fn new(generator: Arc<dyn TextGenerator>, knowledge: KnowledgeStore, retry: RetryPolicy) -> Self {
        Self {
            generator,
            knowledge,
            retry,
        }
    }

    async fn related_context(&self, record: &SummaryRecord) -> String {
        let query = format!("{} {}", record.title, record.summary.research_problem);
        let own_prefix = format!("{}-", record.item_id);

        let similar = match self
            .knowledge
            .retrieve(&query, SIMILAR_FETCHED, &Metadata::new())
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(item_id = %record.item_id, error = %e, "Similarity lookup failed");
                Vec::new()
            }
        };

        let snippets: Vec<String> = similar
            .iter()
            .filter(|hit| !hit.id.starts_with(&own_prefix))
            .take(SIMILAR_USED)
            .enumerate()
            .map(|(i, hit)| format!("{}. {}...", i + 1, truncate_chars(&hit.document, SNIPPET_CHARS)))
            .collect();

        if snippets.is_empty() {
            "No related literature yet.".to_string()
        } else {
            format!("Related literature:\n{}", snippets.join("\n"))
        }
    }

    async fn analyze(&self, record: &SummaryRecord, cancel: &CancellationToken) -> String {
        let context = self.related_context(record).await;
        let prompt = format!(
            "Paper: {}\nResearch problem: {}\nMethod: {}\nValue: {}\n\n{}\n\nPlease give an in-depth analysis.",
            record.title,
            record.summary.research_problem,
            record.summary.method,
            record.summary.value,
            context
        );
        let messages = [ChatMessage::system(prompts::ANALYZER), ChatMessage::user(prompt)];

        match self
            .retry
            .generate_text("analyze", cancel, self.generator.as_ref(), &messages)
            .await
        {
            Ok(text) => text,
            Err(failure) => {
                tracing::error!(item_id = %record.item_id, failure = %failure, "Analysis failed; using placeholder");
                format!(
                    "{} Analysis failed: {}\n{} none",
                    FAILURE_MARKER, failure.reason, KEY_CONCEPTS_PREFIX
                )
            }
        }
    }
}

/// Concepts from the last `Key concepts:` line, at most five
pub fn parse_key_concepts(analysis: &str) -> Vec<String> {
    let lower = analysis.to_lowercase();
    let Some(pos) = lower.rfind(&KEY_CONCEPTS_PREFIX.to_lowercase()) else {
        return Vec::new();
    };
    // Lowercasing can shift byte offsets for some scripts; fall back to no concepts
    let Some(rest) = analysis.get(pos + KEY_CONCEPTS_PREFIX.len()..) else {
        return Vec::new();
    };

    rest.lines()
        .next()
        .unwrap_or_default()
        .split([',', '，', ';', '、'])
        .map(|c| c.trim().trim_end_matches('.').trim())
        .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("none"))
        .take(MAX_KEY_CONCEPTS)
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Handler for AnalyzerStage {
    async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> Result<()> {
        let record = match message {
            Message::Summary(record) => record,
            other => {
                tracing::warn!(kind = other.kind(), "Analyzer ignoring unexpected message");
                return Ok(());
            }
        };

        tracing::info!(item_id = %record.item_id, title = %truncate_chars(&record.title, 40), "Analyzing");
        let analysis = self.analyze(&record, &ctx.cancel).await;
        let key_concepts = parse_key_concepts(&analysis);

        let stored = self
            .knowledge
            .store_document(
                format!("{}-analysis", record.item_id),
                format!("{}\n{}", record.title, analysis),
                metadata([
                    ("type", "analysis"),
                    ("title", record.title.as_str()),
                    ("run", record.run.as_str()),
                ]),
            )
            .await;
        if let Err(e) = stored {
            tracing::warn!(item_id = %record.item_id, error = %e, "Failed to store analysis");
        }

        tracing::info!(item_id = %record.item_id, concepts = key_concepts.len(), "Analysis complete");
        ctx.publish(
            Topic::Grader,
            AnalysisRecord {
                run: record.run,
                item_id: record.item_id,
                title: record.title,
                analysis,
                key_concepts,
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Response, ToolSpec};
    use crate::memory::{HashingEmbedder, KnowledgeDb, SqliteVectorStore};
    use crate::swarm::messages::StructuredSummary;
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl TextGenerator for Unreachable {
        async fn generate(&self, _messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<Response> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    fn stage() -> AnalyzerStage {
        let db = KnowledgeDb::open_in_memory().unwrap();
        let knowledge = KnowledgeStore::new(Arc::new(HashingEmbedder::default()), Arc::new(SqliteVectorStore::new(&db)));
        AnalyzerStage::new(Arc::new(Unreachable), knowledge, RetryPolicy::new(2, Duration::ZERO))
    }

    #[tokio::test]
    async fn test_failed_generation_yields_placeholder() {
        let record = SummaryRecord {
            run: "rag".into(),
            item_id: "2401.00001".into(),
            title: "Dense Retrieval".into(),
            summary: StructuredSummary::failed("offline"),
        };

        let analysis = stage().analyze(&record, &CancellationToken::new()).await;

        assert!(analysis.starts_with(FAILURE_MARKER));
        assert!(analysis.contains("connection refused"));
        assert!(analysis.ends_with("Key concepts: none"));
        assert!(parse_key_concepts(&analysis).is_empty());
    }

    #[test]
    fn test_parse_key_concepts() {
        let text = "Analysis: strong work.\nKey concepts: RAG, dense retrieval,  re-ranking , LLM, agents, tools";
        assert_eq!(
            parse_key_concepts(text),
            vec!["RAG", "dense retrieval", "re-ranking", "LLM", "agents"]
        );
    }

    #[test]
    fn test_parse_key_concepts_uses_last_line_and_ignores_trailing_text() {
        let text = "Key concepts: draft\nAnalysis: ...\nkey concepts: graphs, molecules.\nThanks!";
        assert_eq!(parse_key_concepts(text), vec!["graphs", "molecules"]);
    }

    #[test]
    fn test_parse_key_concepts_placeholder() {
        assert!(parse_key_concepts("no concepts line").is_empty());
        let failed = format!("{} Analysis failed: x\n{} none", FAILURE_MARKER, KEY_CONCEPTS_PREFIX);
        assert!(parse_key_concepts(&failed).is_empty());
    }
}
