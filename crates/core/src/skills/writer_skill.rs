//! # Writer Stage
//!
//! Turns a [`GradeBatch`] into report text. In section flow every outline
//! section is planned, grounded in retrieved knowledge, drafted (through
//! the tool loop when enabled), revised and published to the assembler as
//! its own [`SectionDraft`]; an [`AssembleRequest`] follows once all
//! sections are out. Single-shot flow writes the whole report at once and
//! sends it straight to the coordinator.
//!
//! ```text
//! GradeBatch ──▶ plan ──▶ retrieve ──▶ draft (tool loop | plain) ──▶ revise ──▶ SectionDraft ─┐
//!                  └──────────────────── per outline section, ≤ section_concurrency ──────────┘
//!                                                                    then ──▶ AssembleRequest
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::truncate_chars;
use crate::llm::{run_tool_loop, ChatMessage, RetryPolicy, TextGenerator, ToolBox};
use crate::memory::{metadata, KnowledgeSearchTool, KnowledgeStore, Metadata};
use crate::skills::prompts;
use crate::swarm::bus::{Handler, HandlerContext, Publisher};
use crate::swarm::messages::{
    AssembleRequest, FinalReport, GradeBatch, GradeRecord, Message, SectionDraft, Topic,
    FAILURE_MARKER,
};

const ANALYSIS_EXCERPT_CHARS: usize = 300;

/// Keywords and document kinds a section needs
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SectionPlan {
    pub keywords: Vec<String>,
    pub doc_types: Vec<String>,
}

/// `YYYYmmdd_HHMMSS-<6 hex>`
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Local::now().format("%Y%m%d_%H%M%S"), &suffix[..6])
}

/// `[n] title` for each approved item, numbered from 1
pub fn numbered_references(approved: &[GradeRecord]) -> Vec<String> {
    approved
        .iter()
        .enumerate()
        .map(|(i, g)| format!("[{}] {}", i + 1, g.title))
        .collect()
}

fn papers_digest(approved: &[GradeRecord]) -> String {
    approved
        .iter()
        .enumerate()
        .map(|(i, g)| {
            format!(
                "[{}] {}\nAnalysis: {}...",
                i + 1,
                g.title,
                truncate_chars(&g.analysis, ANALYSIS_EXCERPT_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn snippets(docs: &[crate::memory::ScoredDocument]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, d)| format!("- Excerpt {}: {}...", i + 1, truncate_chars(&d.document, ANALYSIS_EXCERPT_CHARS)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Everything needed to write the sections of one run; cheap to clone into tasks
#[derive(Clone)]
struct SectionWriter {
    generator: Arc<dyn TextGenerator>,
    knowledge: KnowledgeStore,
    config: Arc<PipelineConfig>,
    topic: String,
    run_id: String,
    approved: Arc<Vec<GradeRecord>>,
    cancel: CancellationToken,
}

impl SectionWriter {
    fn cited(&self) -> &[GradeRecord] {
        let k = self.config.section_rag_top_k.min(self.approved.len());
        &self.approved[..k]
    }

    async fn plan(&self, section: &str) -> SectionPlan {
        let titles: Vec<&str> = self.cited().iter().map(|g| g.title.as_str()).collect();
        let messages = [
            ChatMessage::system(prompts::SECTION_PLANNER),
            ChatMessage::user(format!(
                "Topic: {}\nSection: {}\nPapers:\n{}",
                self.topic,
                section,
                titles.join("\n")
            )),
        ];

        // One attempt; a missing plan only narrows retrieval
        let once = RetryPolicy::new(1, Duration::ZERO);
        match once
            .generate_json::<SectionPlan>("plan_section", &self.cancel, self.generator.as_ref(), &messages)
            .await
        {
            Ok(plan) => plan,
            Err(failure) => {
                tracing::debug!(section, failure = %failure, "No section plan");
                SectionPlan::default()
            }
        }
    }

    async fn lookup(&self, query: &str, filter: Metadata) -> String {
        match self
            .knowledge
            .retrieve(query, self.config.section_rag_top_k, &filter)
            .await
        {
            Ok(docs) => snippets(&docs),
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "Section retrieval failed");
                String::new()
            }
        }
    }

    fn section_prompt(&self, section: &str, previous: &str, summaries: &str, analyses: &str) -> String {
        let or = |text: &str, fallback: &str| {
            if text.trim().is_empty() {
                fallback.to_string()
            } else {
                text.to_string()
            }
        };

        format!(
            "WRITING TASK\n\
             Topic: {topic}\n\
             Current section: {section}\n\
             Length: at least {words} words\n\
             Depth: {depth}\n\n\
             REFERENCE MATERIAL\n\n\
             1. Earlier sections of this report\n{previous}\n\n\
             2. Knowledge base: paper summaries\n{summaries}\n\n\
             3. Knowledge base: in-depth analyses\n{analyses}\n\n\
             4. Core papers (cite as [n])\n{papers}\n\n\
             GUIDELINES\n\
             - Use two to four ### subheadings, each with two to four paragraphs.\n\
             - Support every claim with the papers above and cite them as [n].\n\
             - Give concrete data and settings.\n\
             - If you need technical details, you may call the search_knowledge tool.\n\n\
             Write the body of the \"{section}\" section now, without its title:",
            topic = self.topic,
            section = section,
            words = self.config.section_min_words,
            depth = self.config.section_detail_level,
            previous = or(previous, "(This is the first section; nothing written yet.)"),
            summaries = or(summaries, "(No related summaries.)"),
            analyses = or(analyses, "(No related analyses.)"),
            papers = papers_digest(self.cited()),
        )
    }

    async fn draft(&self, idx: usize, messages: Vec<ChatMessage>) -> Option<String> {
        if self.config.writer_use_tools {
            let tools = ToolBox::new().with_tool(Arc::new(
                KnowledgeSearchTool::new(self.knowledge.clone(), self.config.section_rag_top_k)
                    .for_run(&self.run_id),
            ));
            match run_tool_loop(
                self.generator.as_ref(),
                messages.clone(),
                &tools,
                self.config.max_tool_turns,
                &self.cancel,
            )
            .await
            {
                Ok(text) if !text.is_empty() => return Some(text),
                Ok(_) => tracing::warn!(section = idx, "Tool loop returned no text; falling back"),
                Err(e) => tracing::warn!(section = idx, error = %e, "Tool loop failed; falling back to plain generation"),
            }
        }

        match self
            .config
            .retry
            .generate_text("write_section", &self.cancel, self.generator.as_ref(), &messages)
            .await
        {
            Ok(text) => Some(text),
            Err(failure) => {
                tracing::error!(section = idx, failure = %failure, "Section generation failed");
                None
            }
        }
    }

    async fn revise(&self, section: &str, draft: String) -> String {
        let messages = [
            ChatMessage::system(prompts::SECTION_REVISER),
            ChatMessage::user(format!("[Section draft]\n{}\n", draft)),
        ];
        match self
            .config
            .retry
            .generate_text("revise_section", &self.cancel, self.generator.as_ref(), &messages)
            .await
        {
            Ok(revised) => revised,
            Err(failure) => {
                tracing::warn!(section, failure = %failure, "Revision failed; keeping draft");
                draft
            }
        }
    }

    async fn write(&self, idx: usize, section: &str) -> SectionDraft {
        tracing::info!(run_id = %self.run_id, section, idx, "Writing section");

        let plan = self.plan(section).await;
        let query = format!("{} {} {}", self.topic, section, plan.keywords.join(", "))
            .trim()
            .to_string();

        let previous = self
            .lookup(&query, metadata([("type", "section"), ("run_id", self.run_id.as_str())]))
            .await;
        let summaries = self.lookup(&query, metadata([("type", "summary")])).await;
        let analyses = self.lookup(&query, metadata([("type", "analysis")])).await;

        let messages = vec![
            ChatMessage::system(prompts::SECTION_WRITER),
            ChatMessage::user(self.section_prompt(section, &previous, &summaries, &analyses)),
        ];

        let content = match self.draft(idx, messages).await {
            Some(draft) => self.revise(section, draft).await,
            None => format!("{} The \"{}\" section could not be written.", FAILURE_MARKER, section),
        };

        let stored = self
            .knowledge
            .store_document(
                format!("section-{}-{}", self.run_id, idx),
                content.clone(),
                metadata([
                    ("type", "section"),
                    ("run_id", self.run_id.as_str()),
                    ("section", section),
                ]),
            )
            .await;
        if let Err(e) = stored {
            tracing::warn!(section, error = %e, "Failed to store section");
        }

        SectionDraft {
            run_id: self.run_id.clone(),
            section_id: idx.to_string(),
            section_name: section.to_string(),
            content,
            citations: numbered_references(self.cited()),
        }
    }
}

pub struct WriterStage {
    generator: Arc<dyn TextGenerator>,
    knowledge: KnowledgeStore,
    config: Arc<PipelineConfig>,
}

impl WriterStage {
    pub fn new(generator: Arc<dyn TextGenerator>, knowledge: KnowledgeStore, config: Arc<PipelineConfig>) -> Self {
        Self {
            generator,
            knowledge,
            config,
        }
    }

    async fn write_sections(
        &self,
        topic: String,
        approved: Vec<GradeRecord>,
        ctx: &HandlerContext,
    ) -> Result<()> {
        let writer = SectionWriter {
            generator: Arc::clone(&self.generator),
            knowledge: self.knowledge.clone(),
            config: Arc::clone(&self.config),
            topic: topic.clone(),
            run_id: new_run_id(),
            approved: Arc::new(approved),
            cancel: ctx.cancel.clone(),
        };
        let outline = self.config.section_outline.clone();
        let concurrency = self.config.section_concurrency.max(1);
        tracing::info!(run_id = %writer.run_id, sections = outline.len(), concurrency, "Section flow started");

        if concurrency == 1 {
            // Sequential: each section sees the earlier ones through retrieval
            for (idx, section) in outline.iter().enumerate() {
                let draft = writer.write(idx, section).await;
                ctx.publish(Topic::Assembler, draft)?;
            }
        } else {
            write_concurrently(&writer, &outline, concurrency, ctx.publisher.clone()).await;
        }

        ctx.publish(
            Topic::Assembler,
            AssembleRequest {
                run_id: writer.run_id.clone(),
                topic,
                sections: outline,
            },
        )?;
        tracing::info!(run_id = %writer.run_id, "Section drafts submitted for assembly");
        Ok(())
    }

    async fn write_report(&self, topic: String, approved: Vec<GradeRecord>, ctx: &HandlerContext) -> Result<()> {
        tracing::info!(topic = %topic, items = approved.len(), "Writing single-shot report");
        let messages = [
            ChatMessage::system(prompts::REPORT_WRITER),
            ChatMessage::user(format!(
                "Research topic: {}\n\nPaper analyses:\n{}\n\nPlease write the survey report.",
                topic,
                papers_digest(&approved)
            )),
        ];

        let content = match self
            .config
            .retry
            .generate_text("write_report", &ctx.cancel, self.generator.as_ref(), &messages)
            .await
        {
            Ok(text) => text,
            Err(failure) => {
                tracing::error!(topic = %topic, failure = %failure, "Report generation failed");
                format!("{} The report could not be written: {}", FAILURE_MARKER, failure.reason)
            }
        };

        ctx.publish(
            Topic::Coordinator,
            FinalReport {
                references: numbered_references(&approved),
                topic,
                content,
            },
        )?;
        Ok(())
    }
}

/// Up to `limit` sections in flight; each draft is published as soon as it is done
async fn write_concurrently(writer: &SectionWriter, outline: &[String], limit: usize, publisher: Publisher) {
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut tasks = JoinSet::new();

    for (idx, section) in outline.iter().cloned().enumerate() {
        let writer = writer.clone();
        let semaphore = Arc::clone(&semaphore);
        let publisher = publisher.clone();
        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let draft = writer.write(idx, &section).await;
            if let Err(e) = publisher.publish(Topic::Assembler, draft) {
                tracing::error!(section = %section, error = %e, "Failed to publish section draft");
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Section task failed");
        }
    }
}

#[async_trait]
impl Handler for WriterStage {
    async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> Result<()> {
        let GradeBatch { topic, grades } = match message {
            Message::GradeBatch(batch) => batch,
            other => {
                tracing::warn!(kind = other.kind(), "Writer ignoring unexpected message");
                return Ok(());
            }
        };

        let total = grades.len();
        let approved: Vec<GradeRecord> = grades.into_iter().filter(|g| g.approved).collect();
        tracing::info!(topic = %topic, total, approved = approved.len(), "Grade batch received");
        if approved.len() < self.config.min_items_for_report {
            tracing::warn!(
                approved = approved.len(),
                minimum = self.config.min_items_for_report,
                "Fewer approved items than recommended; writing anyway"
            );
        }

        if self.config.section_flow {
            self.write_sections(topic, approved, ctx).await
        } else {
            self.write_report(topic, approved, ctx).await
        }
    }
}
