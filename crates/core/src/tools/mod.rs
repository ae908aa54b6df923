//! # External Collaborators
//!
//! The non-LLM capabilities the pipeline consumes, each behind a trait so
//! tests can swap in stubs.
//!
//! - `arxiv` - item search ([`ItemSearch`]) with a content-addressed cache
//! - `report_sink` - final report persistence ([`ReportSink`])

pub mod arxiv;
pub mod report_sink;

pub use arxiv::{ArxivSearch, CachedSearch, ItemSearch};
pub use report_sink::{FileReportSink, ReportSink};
