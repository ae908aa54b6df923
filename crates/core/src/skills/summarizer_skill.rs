//! # Summarizer Stage
//!
//! Extracts the research problem, method and value of every item as
//! strict JSON, keeps a one-paragraph brief in the knowledge store and
//! forwards one [`SummaryRecord`] per item.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatMessage, RetryPolicy, TextGenerator};
use crate::memory::{metadata, KnowledgeStore};
use crate::skills::prompts;
use crate::swarm::bus::{Handler, HandlerContext};
use crate::swarm::messages::{Item, ItemBatch, Message, StructuredSummary, SummaryRecord, Topic};

pub struct SummarizerStage {
    generator: Arc<dyn TextGenerator>,
    knowledge: KnowledgeStore,
    retry: RetryPolicy,
}

impl SummarizerStage {
    pub fn new(generator: Arc<dyn TextGenerator>, knowledge: KnowledgeStore, retry: RetryPolicy) -> Self {
        Self {
            generator,
            knowledge,
            retry,
        }
    }

    async fn summarize(&self, item: &Item, cancel: &CancellationToken) -> StructuredSummary {
        let messages = [
            ChatMessage::system(prompts::SUMMARIZER),
            ChatMessage::user(format!("Title: {}\n\nAbstract: {}", item.title, item.body)),
        ];

        match self
            .retry
            .generate_json::<StructuredSummary>("summarize", cancel, self.generator.as_ref(), &messages)
            .await
        {
            Ok(summary) => summary,
            Err(failure) => {
                tracing::error!(item_id = %item.id, failure = %failure, "Summary failed; using placeholder");
                StructuredSummary::failed(&failure.reason)
            }
        }
    }

    async fn remember(&self, run: &str, item: &Item, summary: &StructuredSummary) {
        let brief = summary_brief(&item.title, summary);
        let result = self
            .knowledge
            .store_document(
                format!("{}-summary", item.id),
                brief,
                metadata([("type", "summary"), ("title", item.title.as_str()), ("run", run)]),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(item_id = %item.id, error = %e, "Failed to store summary");
        }
    }
}

/// One-paragraph form of a summary, as stored for retrieval
pub fn summary_brief(title: &str, summary: &StructuredSummary) -> String {
    format!(
        "{}\nProblem: {} Method: {} Value: {}",
        title, summary.research_problem, summary.method, summary.value
    )
}

#[async_trait]
impl Handler for SummarizerStage {
    async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> Result<()> {
        let ItemBatch { run, items } = match message {
            Message::ItemBatch(batch) => batch,
            other => {
                tracing::warn!(kind = other.kind(), "Summarizer ignoring unexpected message");
                return Ok(());
            }
        };

        tracing::info!(run = %run, items = items.len(), "Summarizing items");
        for item in items {
            let summary = self.summarize(&item, &ctx.cancel).await;
            // Stored before publishing so later items can already retrieve it
            self.remember(&run, &item, &summary).await;

            ctx.publish(
                Topic::Analyzer,
                SummaryRecord {
                    run: run.clone(),
                    item_id: item.id,
                    title: item.title,
                    summary,
                },
            )?;
        }
        tracing::info!(run = %run, "Summaries complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Response, ToolSpec};
    use crate::memory::{HashingEmbedder, KnowledgeDb, SqliteVectorStore};
    use crate::swarm::messages::{ItemMetadata, FAILURE_MARKER};
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl TextGenerator for Unreachable {
        async fn generate(&self, _messages: &[ChatMessage], _tools: &[ToolSpec]) -> Result<Response> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    fn item() -> Item {
        Item {
            id: "2401.00001".into(),
            title: "Dense Retrieval".into(),
            body: "We study dense retrieval.".into(),
            metadata: ItemMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_failed_generation_yields_sentinel_summary() {
        let db = KnowledgeDb::open_in_memory().unwrap();
        let knowledge = KnowledgeStore::new(Arc::new(HashingEmbedder::default()), Arc::new(SqliteVectorStore::new(&db)));
        let stage = SummarizerStage::new(Arc::new(Unreachable), knowledge.clone(), RetryPolicy::new(2, Duration::ZERO));

        let summary = stage.summarize(&item(), &CancellationToken::new()).await;
        assert!(summary.is_failed());
        assert!(summary.method.starts_with(FAILURE_MARKER));
        assert!(summary.value.contains("connection refused"));

        // The placeholder is still remembered so retrieval sees every item
        stage.remember("rag", &item(), &summary).await;
        assert_eq!(knowledge.count().unwrap(), 1);
    }

    #[test]
    fn test_summary_brief() {
        let summary = StructuredSummary {
            research_problem: "recall".into(),
            method: "dense index".into(),
            value: "speed".into(),
        };
        assert_eq!(
            summary_brief("Dense Retrieval", &summary),
            "Dense Retrieval\nProblem: recall Method: dense index Value: speed"
        );
    }
}
