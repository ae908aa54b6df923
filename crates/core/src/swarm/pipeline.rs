//! # Research Pipeline
//!
//! Wires the seven stages onto a fresh [`MessageBus`] for one run, kicks
//! off the collector and waits for the bus to go idle.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bus::MessageBus;
use super::coordinator::{CoordinatorStage, ReportSaved};
use super::messages::{ItemRequest, Topic};
use crate::config::PipelineConfig;
use crate::llm::TextGenerator;
use crate::memory::KnowledgeStore;
use crate::skills::{
    AnalyzerStage, AssemblerStage, CollectorStage, GraderStage, Reviewer, SummarizerStage,
    WriterStage,
};
use crate::tools::{ItemSearch, ReportSink};

/// External collaborators the stages call into
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn TextGenerator>,
    pub search: Arc<dyn ItemSearch>,
    pub knowledge: KnowledgeStore,
    pub sink: Arc<dyn ReportSink>,
    pub reviewer: Arc<dyn Reviewer>,
}

/// What a finished run produced
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Reports written during the run; empty if the run stalled
    pub reports: Vec<ReportSaved>,
}

pub struct ResearchPipeline {
    config: Arc<PipelineConfig>,
    collaborators: Collaborators,
    cancel: CancellationToken,
}

impl ResearchPipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            collaborators,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `token` aborts in-flight retries in every stage
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn build_bus(&self, saved_tx: mpsc::UnboundedSender<ReportSaved>) -> Result<MessageBus> {
        let mut bus = MessageBus::with_cancellation(self.cancel.clone());
        let c = &self.collaborators;
        let retry = self.config.retry.clone();

        let search = Arc::clone(&c.search);
        bus.register(Topic::Collector, move || CollectorStage::new(search))?;

        let (generator, knowledge, policy) = (Arc::clone(&c.generator), c.knowledge.clone(), retry.clone());
        bus.register(Topic::Summarizer, move || SummarizerStage::new(generator, knowledge, policy))?;

        let (generator, knowledge, policy) = (Arc::clone(&c.generator), c.knowledge.clone(), retry.clone());
        bus.register(Topic::Analyzer, move || AnalyzerStage::new(generator, knowledge, policy))?;

        let (threshold, reviewer) = (self.config.risk_threshold, Arc::clone(&c.reviewer));
        bus.register(Topic::Grader, move || GraderStage::new(threshold, reviewer))?;

        let sink = Arc::clone(&c.sink);
        bus.register(Topic::Coordinator, move || {
            CoordinatorStage::new(sink).with_notifier(saved_tx)
        })?;

        let (generator, knowledge, config) = (Arc::clone(&c.generator), c.knowledge.clone(), Arc::clone(&self.config));
        bus.register(Topic::Writer, move || WriterStage::new(generator, knowledge, config))?;

        let polisher = self.config.polish_final_report.then(|| Arc::clone(&c.generator));
        bus.register(Topic::Assembler, move || {
            let stage = AssemblerStage::new(retry);
            match polisher {
                Some(generator) => stage.with_polisher(generator),
                None => stage,
            }
        })?;

        Ok(bus)
    }

    /// Run the whole pipeline for `topic` and wait until every stage is idle
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, topic: &str, max_items: usize) -> Result<RunOutcome> {
        let (saved_tx, mut saved_rx) = mpsc::unbounded_channel();
        let mut bus = self.build_bus(saved_tx).context("Failed to wire pipeline stages")?;
        bus.start();

        tracing::info!(max_items, "Run started");
        bus.publish(
            Topic::Collector,
            ItemRequest {
                keyword: topic.to_string(),
                max_count: max_items,
            },
        )
        .context("Failed to submit item request")?;

        bus.drain_until_idle().await;
        bus.shutdown().await;

        let mut outcome = RunOutcome::default();
        while let Ok(saved) = saved_rx.try_recv() {
            outcome.reports.push(saved);
        }
        if outcome.reports.is_empty() {
            tracing::warn!("Run finished without a report");
        } else {
            tracing::info!(reports = outcome.reports.len(), "Run finished");
        }
        Ok(outcome)
    }
}
