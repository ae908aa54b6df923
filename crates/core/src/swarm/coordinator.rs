//! # Run Coordinator
//!
//! Count-gated aggregation. A [`RunPlan`] announces how many grades a run
//! will produce; once that many have arrived the coordinator publishes a
//! single [`GradeBatch`] to the writer. It also receives the finished
//! report and hands it to the [`ReportSink`].
//!
//! ```text
//! Idle ──RunPlan──▶ Collecting ──Grade──▶ Accumulating ──count >= total──▶ Fired
//!   ▲                                                                        │
//!   └──────────────────────────── RunPlan (same topic) ◀─────────────────────┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::bus::{Handler, HandlerContext};
use super::messages::{FinalReport, GradeBatch, GradeRecord, Message, RunPlan, Topic};
use crate::tools::ReportSink;

/// Where a run stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// No plan received
    Idle,
    /// Plan received, no grades yet
    Collecting,
    /// Some grades received, threshold not reached
    Accumulating,
    /// Batch published
    Fired,
}

/// Accumulator for one run
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub total: usize,
    pub grades: Vec<GradeRecord>,
    pub fired: bool,
    /// Grades that arrived after the batch was sent; counted, not kept
    pub late: usize,
}

impl RunState {
    pub fn phase(&self) -> RunPhase {
        if self.fired {
            RunPhase::Fired
        } else if self.grades.is_empty() {
            RunPhase::Collecting
        } else {
            RunPhase::Accumulating
        }
    }
}

/// Sent to the driver once a report is on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSaved {
    pub topic: String,
    pub path: PathBuf,
    pub references: usize,
}

/// The coordinator stage
pub struct CoordinatorStage {
    runs: HashMap<String, RunState>,
    sink: Arc<dyn ReportSink>,
    saved_tx: Option<mpsc::UnboundedSender<ReportSaved>>,
}

impl CoordinatorStage {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self {
            runs: HashMap::new(),
            sink,
            saved_tx: None,
        }
    }

    /// Notify `tx` for every saved report
    pub fn with_notifier(mut self, tx: mpsc::UnboundedSender<ReportSaved>) -> Self {
        self.saved_tx = Some(tx);
        self
    }

    pub fn phase(&self, run: &str) -> RunPhase {
        self.runs.get(run).map(RunState::phase).unwrap_or(RunPhase::Idle)
    }

    /// Start (or restart) a run: last plan wins
    pub fn on_plan(&mut self, plan: RunPlan) {
        if plan.total == 0 {
            tracing::warn!(run = %plan.run_topic, "Run announced zero items; no batch will be produced");
        }
        if self.runs.contains_key(&plan.run_topic) {
            tracing::info!(run = %plan.run_topic, "New plan resets run");
        }
        tracing::info!(run = %plan.run_topic, total = plan.total, "Run planned");
        self.runs.insert(
            plan.run_topic,
            RunState {
                total: plan.total,
                ..RunState::default()
            },
        );
    }

    /// Record a grade; returns the batch exactly once, when the count first reaches the total
    pub fn on_grade(&mut self, grade: GradeRecord) -> Option<GradeBatch> {
        let Some(state) = self.runs.get_mut(&grade.run) else {
            tracing::warn!(run = %grade.run, item_id = %grade.item_id, "Grade for unplanned run ignored");
            return None;
        };

        if state.fired {
            state.late += 1;
            tracing::debug!(run = %grade.run, item_id = %grade.item_id, late = state.late, "Late grade after batch was sent; dropped");
            return None;
        }

        let run = grade.run.clone();
        state.grades.push(grade);
        let count = state.grades.len();
        tracing::info!(run = %run, count, total = state.total, "Grade received");

        if state.total == 0 || count < state.total {
            return None;
        }

        state.fired = true;
        Some(GradeBatch {
            topic: run,
            grades: std::mem::take(&mut state.grades),
        })
    }

    async fn on_report(&self, report: FinalReport) -> Result<()> {
        let path = self
            .sink
            .save(&report.topic, &report.content, &report.references)
            .await?;
        tracing::info!(
            topic = %report.topic,
            path = %path.display(),
            references = report.references.len(),
            "Report saved"
        );

        if let Some(tx) = &self.saved_tx {
            let saved = ReportSaved {
                topic: report.topic,
                path,
                references: report.references.len(),
            };
            if tx.send(saved).is_err() {
                tracing::debug!("Driver no longer listening for saved reports");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for CoordinatorStage {
    async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> Result<()> {
        match message {
            Message::RunPlan(plan) => self.on_plan(plan),
            Message::Grade(grade) => {
                if let Some(batch) = self.on_grade(grade) {
                    let approved = batch.grades.iter().filter(|g| g.approved).count();
                    tracing::info!(
                        run = %batch.topic,
                        grades = batch.grades.len(),
                        approved,
                        "All grades in; handing batch to writer"
                    );
                    ctx.publish(Topic::Writer, batch)?;
                }
            }
            Message::Report(report) => self.on_report(report).await?,
            other => {
                tracing::warn!(kind = other.kind(), "Coordinator ignoring unexpected message");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    #[async_trait]
    impl ReportSink for NullSink {
        async fn save(&self, topic: &str, _content: &str, _references: &[String]) -> Result<PathBuf> {
            Ok(PathBuf::from(format!("/reports/{}.md", topic)))
        }
    }

    fn stage() -> CoordinatorStage {
        CoordinatorStage::new(Arc::new(NullSink))
    }

    fn plan(run: &str, total: usize) -> RunPlan {
        RunPlan {
            run_topic: run.into(),
            total,
        }
    }

    fn grade(run: &str, id: &str) -> GradeRecord {
        GradeRecord {
            run: run.into(),
            item_id: id.into(),
            title: format!("Paper {}", id),
            risk_score: 0.0,
            approved: id != "B",
            analysis: "analysis".into(),
        }
    }

    #[test]
    fn test_fires_once_with_all_grades() {
        let mut coordinator = stage();
        assert_eq!(coordinator.phase("X"), RunPhase::Idle);
        coordinator.on_plan(plan("X", 3));
        assert_eq!(coordinator.phase("X"), RunPhase::Collecting);

        assert!(coordinator.on_grade(grade("X", "C")).is_none());
        assert_eq!(coordinator.phase("X"), RunPhase::Accumulating);
        assert!(coordinator.on_grade(grade("X", "A")).is_none());

        let batch = coordinator.on_grade(grade("X", "B")).unwrap();
        assert_eq!(batch.topic, "X");
        let mut ids: Vec<_> = batch.grades.iter().map(|g| g.item_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, ["A", "B", "C"]);
        // Unapproved grades are kept
        assert!(batch.grades.iter().any(|g| !g.approved));
        assert_eq!(coordinator.phase("X"), RunPhase::Fired);

        assert!(coordinator.on_grade(grade("X", "A")).is_none());
    }

    #[test]
    fn test_late_grades_are_counted_not_kept() {
        let mut coordinator = stage();
        coordinator.on_plan(plan("X", 2));
        coordinator.on_grade(grade("X", "A"));
        assert!(coordinator.on_grade(grade("X", "B")).is_some());

        for id in ["A", "B", "A"] {
            assert!(coordinator.on_grade(grade("X", id)).is_none());
        }

        let state = &coordinator.runs["X"];
        assert_eq!(state.late, 3);
        assert!(state.grades.is_empty());
        assert_eq!(coordinator.phase("X"), RunPhase::Fired);
    }

    #[test]
    fn test_new_plan_resets_accumulator() {
        let mut coordinator = stage();
        coordinator.on_plan(plan("X", 2));
        coordinator.on_grade(grade("X", "A"));
        coordinator.on_plan(plan("X", 2));

        assert_eq!(coordinator.phase("X"), RunPhase::Collecting);
        assert!(coordinator.on_grade(grade("X", "A")).is_none());
        assert!(coordinator.on_grade(grade("X", "B")).is_some());
    }

    #[test]
    fn test_runs_do_not_interfere() {
        let mut coordinator = stage();
        coordinator.on_plan(plan("X", 1));
        coordinator.on_plan(plan("Y", 2));

        assert!(coordinator.on_grade(grade("Y", "A")).is_none());
        let batch = coordinator.on_grade(grade("X", "A")).unwrap();
        assert_eq!(batch.grades.len(), 1);
        assert_eq!(coordinator.phase("Y"), RunPhase::Accumulating);
    }

    #[test]
    fn test_unplanned_and_empty_runs_never_fire() {
        let mut coordinator = stage();
        assert!(coordinator.on_grade(grade("ghost", "A")).is_none());
        assert_eq!(coordinator.phase("ghost"), RunPhase::Idle);

        coordinator.on_plan(plan("empty", 0));
        assert!(coordinator.on_grade(grade("empty", "A")).is_none());
    }

    #[test]
    fn test_over_announced_total_stalls() {
        let mut coordinator = stage();
        coordinator.on_plan(plan("X", 3));
        assert!(coordinator.on_grade(grade("X", "A")).is_none());
        assert!(coordinator.on_grade(grade("X", "B")).is_none());
        assert_eq!(coordinator.phase("X"), RunPhase::Accumulating);
    }

    #[test]
    fn test_under_announced_total_fires_early() {
        let mut coordinator = stage();
        coordinator.on_plan(plan("X", 1));
        let batch = coordinator.on_grade(grade("X", "A")).unwrap();
        assert_eq!(batch.grades.len(), 1);
        assert!(coordinator.on_grade(grade("X", "B")).is_none());
    }

    #[tokio::test]
    async fn test_report_notifies_driver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = stage().with_notifier(tx);
        coordinator
            .on_report(FinalReport {
                topic: "rag".into(),
                content: "# rag".into(),
                references: vec!["[1] A".into()],
            })
            .await
            .unwrap();

        let saved = rx.recv().await.unwrap();
        assert_eq!(saved.path, PathBuf::from("/reports/rag.md"));
        assert_eq!(saved.references, 1);
    }

    #[tokio::test]
    async fn test_report_saved_after_driver_left() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let coordinator = stage().with_notifier(tx);
        let result = coordinator
            .on_report(FinalReport {
                topic: "rag".into(),
                content: "# rag".into(),
                references: Vec::new(),
            })
            .await;
        assert!(result.is_ok());
    }
}
