//! # Stage Handlers
//!
//! One [`Handler`](crate::swarm::bus::Handler) per pipeline topic, apart
//! from the coordinator which lives with the bus in [`crate::swarm`].
//!
//! ```text
//! Collector ──▶ Summarizer ──▶ Analyzer ──▶ Grader ──▶ (Coordinator)
//!                                                          │
//!                                          Writer ◀────────┘
//!                                            │
//!                                            └──▶ Assembler ──▶ (Coordinator)
//! ```
//!
//! Prompt templates ship in `defaults/` and are compiled in through
//! [`prompts`].

pub mod prompts;

pub mod analyzer_skill;
pub mod assembler_skill;
pub mod collector_skill;
pub mod grader_skill;
pub mod summarizer_skill;
pub mod writer_skill;

pub use analyzer_skill::{parse_key_concepts, AnalyzerStage};
pub use assembler_skill::{assemble, dedup_citations, post_process, AssemblerStage};
pub use collector_skill::CollectorStage;
pub use grader_skill::{risk_score, AutoReject, GraderStage, ReviewRequest, Reviewer};
pub use summarizer_skill::SummarizerStage;
pub use writer_skill::{new_run_id, WriterStage};
