//! # Grader Stage
//!
//! Scores each analysis for risk and asks a [`Reviewer`] about the risky
//! ones. Every item produces a [`GradeRecord`], approved or not, so the
//! coordinator's count always reaches the announced total.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::error::truncate_chars;
use crate::swarm::bus::{Handler, HandlerContext};
use crate::swarm::messages::{AnalysisRecord, GradeRecord, Message, Topic, FAILURE_MARKER};

/// What a reviewer is shown
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRequest {
    pub item_id: String,
    pub title: String,
    pub risk_score: f32,
    /// First 200 characters of the analysis
    pub excerpt: String,
}

/// Human (or policy) decision on a high-risk item
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: &ReviewRequest) -> bool;
}

/// Rejects everything it is asked about
pub struct AutoReject;

#[async_trait]
impl Reviewer for AutoReject {
    async fn review(&self, request: &ReviewRequest) -> bool {
        tracing::info!(item_id = %request.item_id, risk = request.risk_score, "High-risk item rejected automatically");
        false
    }
}

/// Heuristic risk: short analysis, few concepts, generation failure
pub fn risk_score(analysis: &str, key_concepts: &[String]) -> f32 {
    let mut score = 0.0;
    if analysis.chars().count() < 100 {
        score += 3.0;
    }
    if key_concepts.len() < 2 {
        score += 2.0;
    }
    if analysis.contains(FAILURE_MARKER) {
        score += 5.0;
    }
    score
}

pub struct GraderStage {
    risk_threshold: f32,
    reviewer: Arc<dyn Reviewer>,
}

impl GraderStage {
    pub fn new(risk_threshold: f32, reviewer: Arc<dyn Reviewer>) -> Self {
        Self {
            risk_threshold,
            reviewer,
        }
    }

    pub async fn grade(&self, record: AnalysisRecord) -> GradeRecord {
        let score = risk_score(&record.analysis, &record.key_concepts);

        let approved = if score >= self.risk_threshold {
            tracing::warn!(item_id = %record.item_id, risk = score, "High-risk analysis, asking reviewer");
            self.reviewer
                .review(&ReviewRequest {
                    item_id: record.item_id.clone(),
                    title: record.title.clone(),
                    risk_score: score,
                    excerpt: truncate_chars(&record.analysis, 200),
                })
                .await
        } else {
            true
        };

        tracing::info!(item_id = %record.item_id, risk = score, approved, "Graded");
        GradeRecord {
            run: record.run,
            item_id: record.item_id,
            title: record.title,
            risk_score: score,
            approved,
            analysis: record.analysis,
        }
    }
}

#[async_trait]
impl Handler for GraderStage {
    async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> Result<()> {
        match message {
            Message::Analysis(record) => {
                let grade = self.grade(record).await;
                ctx.publish(Topic::Coordinator, grade)?;
            }
            other => {
                tracing::warn!(kind = other.kind(), "Grader ignoring unexpected message");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        asked: Mutex<Vec<String>>,
        answer: bool,
    }

    #[async_trait]
    impl Reviewer for Recording {
        async fn review(&self, request: &ReviewRequest) -> bool {
            self.asked.lock().unwrap().push(request.item_id.clone());
            self.answer
        }
    }

    fn record(id: &str, analysis: &str, concepts: &[&str]) -> AnalysisRecord {
        AnalysisRecord {
            run: "rag".into(),
            item_id: id.into(),
            title: format!("Paper {}", id),
            analysis: analysis.into(),
            key_concepts: concepts.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn test_risk_score_components() {
        let long = "x".repeat(150);
        let two = vec!["a".to_string(), "b".to_string()];
        assert_eq!(risk_score(&long, &two), 0.0);
        assert_eq!(risk_score("short", &two), 3.0);
        assert_eq!(risk_score(&long, &[]), 2.0);
        let failed = format!("{} {}", FAILURE_MARKER, long);
        assert_eq!(risk_score(&failed, &[]), 7.0);
        assert_eq!(risk_score(FAILURE_MARKER, &[]), 10.0);
    }

    #[tokio::test]
    async fn test_low_risk_skips_reviewer() {
        let reviewer = Arc::new(Recording {
            asked: Mutex::new(Vec::new()),
            answer: false,
        });
        let grader = GraderStage::new(4.0, reviewer.clone());

        // 3.0 is below the threshold
        let grade = grader.grade(record("A", "short", &["x", "y"])).await;
        assert!(grade.approved);
        assert_eq!(grade.risk_score, 3.0);
        assert!(reviewer.asked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_high_risk_goes_to_reviewer() {
        let reviewer = Arc::new(Recording {
            asked: Mutex::new(Vec::new()),
            answer: true,
        });
        let grader = GraderStage::new(4.0, reviewer.clone());

        let grade = grader.grade(record("B", "short", &[])).await;
        assert!(grade.approved);
        assert_eq!(*reviewer.asked.lock().unwrap(), vec!["B"]);

        let rejected = GraderStage::new(4.0, Arc::new(AutoReject))
            .grade(record("C", "short", &[]))
            .await;
        assert!(!rejected.approved);
        assert_eq!(rejected.run, "rag");
    }
}
