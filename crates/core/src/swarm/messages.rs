//! # Pipeline Messages
//!
//! Typed payloads exchanged between stages, addressed by [`Topic`].
//! Per-item records carry the run they belong to, so state keyed by run
//! never mixes two runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker embedded in placeholder text produced when generation gave up
pub const FAILURE_MARKER: &str = "[generation failed]";

/// A named channel; each has exactly one handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Collector,
    Summarizer,
    Analyzer,
    Grader,
    Coordinator,
    Writer,
    Assembler,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Collector => "collector",
            Topic::Summarizer => "summarizer",
            Topic::Analyzer => "analyzer",
            Topic::Grader => "grader",
            Topic::Coordinator => "coordinator",
            Topic::Writer => "writer",
            Topic::Assembler => "assembler",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// Descriptive fields of a source item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemMetadata {
    pub authors: Vec<String>,
    /// Publication date, `YYYY-MM-DD`
    pub published: String,
    pub url: String,
    pub categories: Vec<String>,
}

/// External unit of work, as returned by the search collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub metadata: ItemMetadata,
}

/// Start a run: search for `keyword`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub keyword: String,
    pub max_count: usize,
}

/// Everything the collector found for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemBatch {
    pub run: String,
    pub items: Vec<Item>,
}

/// The three fixed summary fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredSummary {
    pub research_problem: String,
    pub method: String,
    pub value: String,
}

impl StructuredSummary {
    /// Placeholder used when generation gave up
    pub fn failed(reason: &str) -> Self {
        let text = format!("{} {}", FAILURE_MARKER, reason);
        Self {
            research_problem: text.clone(),
            method: text.clone(),
            value: text,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.research_problem.contains(FAILURE_MARKER)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub run: String,
    pub item_id: String,
    pub title: String,
    pub summary: StructuredSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub run: String,
    pub item_id: String,
    pub title: String,
    pub analysis: String,
    pub key_concepts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecord {
    pub run: String,
    pub item_id: String,
    pub title: String,
    pub risk_score: f32,
    pub approved: bool,
    pub analysis: String,
}

/// Completion threshold for a run; a new plan for the same topic resets it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPlan {
    pub run_topic: String,
    pub total: usize,
}

/// Every grade of a run, approved or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBatch {
    pub topic: String,
    pub grades: Vec<GradeRecord>,
}

/// One written section, keyed by `(run_id, section_id)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDraft {
    pub run_id: String,
    /// Position in the outline, as a string
    pub section_id: String,
    pub section_name: String,
    pub content: String,
    pub citations: Vec<String>,
}

/// Explicit trigger to merge a run's drafts in `sections` order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembleRequest {
    pub run_id: String,
    pub topic: String,
    pub sections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalReport {
    pub topic: String,
    pub content: String,
    pub references: Vec<String>,
}

// ============================================================================
// Envelope
// ============================================================================

/// Anything that travels on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ItemRequest(ItemRequest),
    ItemBatch(ItemBatch),
    Summary(SummaryRecord),
    Analysis(AnalysisRecord),
    Grade(GradeRecord),
    RunPlan(RunPlan),
    GradeBatch(GradeBatch),
    SectionDraft(SectionDraft),
    Assemble(AssembleRequest),
    Report(FinalReport),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ItemRequest(_) => "item_request",
            Message::ItemBatch(_) => "item_batch",
            Message::Summary(_) => "summary",
            Message::Analysis(_) => "analysis",
            Message::Grade(_) => "grade",
            Message::RunPlan(_) => "run_plan",
            Message::GradeBatch(_) => "grade_batch",
            Message::SectionDraft(_) => "section_draft",
            Message::Assemble(_) => "assemble",
            Message::Report(_) => "report",
        }
    }
}

macro_rules! impl_into_message {
    ($($payload:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$payload> for Message {
                fn from(payload: $payload) -> Self {
                    Message::$variant(payload)
                }
            }
        )*
    };
}

impl_into_message! {
    ItemRequest => ItemRequest,
    ItemBatch => ItemBatch,
    SummaryRecord => Summary,
    AnalysisRecord => Analysis,
    GradeRecord => Grade,
    RunPlan => RunPlan,
    GradeBatch => GradeBatch,
    SectionDraft => SectionDraft,
    AssembleRequest => Assemble,
    FinalReport => Report,
}

/// A message in a mailbox
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Bus-wide publish order
    pub seq: u64,
    /// Publishing stage; `None` for the driver
    pub sender: Option<Topic>,
    pub message: Message,
}
