//! # Assembler Stage
//!
//! Collects [`SectionDraft`]s per run and, when an [`AssembleRequest`]
//! arrives, merges them in the requested order into one [`FinalReport`].
//! Assembly never waits and never fails: missing sections are logged and
//! skipped, and a report is always published.

use anyhow::Result;
use async_trait::async_trait;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatMessage, RetryPolicy, TextGenerator};
use crate::skills::prompts;
use crate::swarm::bus::{Handler, HandlerContext};
use crate::swarm::messages::{AssembleRequest, FinalReport, Message, SectionDraft, Topic};

const MAX_BOLD_PER_PARAGRAPH: usize = 3;

/// Label lines a reviser may echo around its output; only the line is dropped
const LABEL_LINES: &[&str] = &["[Section draft]", "[Revised section]", "[Verified section]"];

/// Headings that open a block of editing notes, skipped up to the next section
const NOTE_HEADINGS: &[&str] = &["Technical review", "Revision notes", "Main changes"];

/// Result of merging one run's drafts
#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub body: String,
    pub citations: Vec<String>,
    /// Declared sections that had no draft
    pub missing: Vec<String>,
}

/// Merge `drafts` in `sections` order.
///
/// A section is looked up by its outline position first, then by name.
pub fn assemble(drafts: &HashMap<String, SectionDraft>, sections: &[String]) -> Assembled {
    let mut parts = Vec::new();
    let mut used = Vec::new();
    let mut missing = Vec::new();

    for (idx, name) in sections.iter().enumerate() {
        let found = drafts
            .get(&idx.to_string())
            .or_else(|| drafts.values().find(|d| &d.section_name == name));
        match found {
            Some(draft) => {
                parts.push(format!("## {}\n\n{}\n", name, draft.content.trim()));
                used.push(draft);
            }
            None => missing.push(name.clone()),
        }
    }

    Assembled {
        body: parts.join("\n"),
        citations: dedup_citations(used),
        missing,
    }
}

/// Concatenate citation lists keeping the first occurrence of each
pub fn dedup_citations<'a>(drafts: impl IntoIterator<Item = &'a SectionDraft>) -> Vec<String> {
    let mut seen = HashSet::new();
    drafts
        .into_iter()
        .flat_map(|d| d.citations.iter())
        .filter(|c| seen.insert(*c))
        .cloned()
        .collect()
}

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(pattern, error = %e, "Invalid cleanup pattern; pass skipped");
            None
        }
    })
    .as_ref()
}

fn transitions() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"(?m)^(?:Firstly|Secondly|Thirdly|Lastly|In conclusion|In summary|To sum up|It is worth noting that|It should be noted that|It is important to note that)[,:]?\s+(\S)",
    )
}

fn bold() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"\*\*([^*\n]+)\*\*")
}

fn blank_runs() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"\n{3,}")
}

fn bare_heading(line: &str) -> &str {
    line.trim()
        .trim_start_matches(|c: char| c == '#' || c == '*' || c.is_whitespace())
        .trim_end_matches(|c: char| c == ':' || c == '*' || c.is_whitespace())
}

/// Drop echoed labels and editing-note blocks.
///
/// A note block runs until the next `## <section>` heading of `sections`.
fn strip_revision_notes(text: &str, sections: &[String]) -> String {
    let section_headings: HashSet<String> = sections.iter().map(|s| format!("## {}", s)).collect();
    let mut kept = Vec::new();
    let mut skipping = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if section_headings.contains(trimmed) {
            skipping = false;
            kept.push(line);
            continue;
        }
        if LABEL_LINES.iter().any(|l| trimmed.eq_ignore_ascii_case(l)) {
            continue;
        }
        let bare = bare_heading(line);
        if NOTE_HEADINGS.iter().any(|h| bare.eq_ignore_ascii_case(h)) {
            skipping = true;
            continue;
        }
        if !skipping {
            kept.push(line);
        }
    }
    kept.join("\n")
}

fn cap_bold(paragraph: &str) -> String {
    let Some(re) = bold() else {
        return paragraph.to_string();
    };
    let mut count = 0;
    re.replace_all(paragraph, |caps: &Captures| {
        count += 1;
        if count > MAX_BOLD_PER_PARAGRAPH {
            caps[1].to_string()
        } else {
            caps[0].to_string()
        }
    })
    .into_owned()
}

/// Deterministic cleanup of merged report text whose sections are `sections`
pub fn post_process(text: &str, sections: &[String]) -> String {
    let mut text = strip_revision_notes(text, sections);

    if let Some(re) = transitions() {
        text = re
            .replace_all(&text, |caps: &Captures| caps[1].to_uppercase())
            .into_owned();
    }

    text = text
        .split("\n\n")
        .map(cap_bold)
        .collect::<Vec<_>>()
        .join("\n\n");

    if let Some(re) = blank_runs() {
        text = re.replace_all(&text, "\n\n").into_owned();
    }
    text.trim().to_string()
}

pub struct AssemblerStage {
    drafts: HashMap<String, HashMap<String, SectionDraft>>,
    polisher: Option<Arc<dyn TextGenerator>>,
    retry: RetryPolicy,
}

impl AssemblerStage {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            drafts: HashMap::new(),
            polisher: None,
            retry,
        }
    }

    /// Run a final polish pass through `generator`
    pub fn with_polisher(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.polisher = Some(generator);
        self
    }

    /// Upsert by section id; a resent draft replaces the earlier one
    pub fn collect_draft(&mut self, draft: SectionDraft) {
        tracing::debug!(run_id = %draft.run_id, section = %draft.section_name, "Draft collected");
        self.drafts
            .entry(draft.run_id.clone())
            .or_default()
            .insert(draft.section_id.clone(), draft);
    }

    /// Drafts held for `run_id`
    pub fn draft_count(&self, run_id: &str) -> usize {
        self.drafts.get(run_id).map_or(0, HashMap::len)
    }

    async fn polish(&self, body: String, cancel: &CancellationToken) -> String {
        let Some(generator) = &self.polisher else {
            return body;
        };
        let messages = [
            ChatMessage::system(prompts::REPORT_POLISHER),
            ChatMessage::user(body.clone()),
        ];
        match self
            .retry
            .generate_text("polish_report", cancel, generator.as_ref(), &messages)
            .await
        {
            Ok(polished) => polished,
            Err(failure) => {
                tracing::warn!(failure = %failure, "Polish failed; keeping merged text");
                body
            }
        }
    }

    pub async fn build_report(&mut self, request: AssembleRequest, cancel: &CancellationToken) -> FinalReport {
        let drafts = self.drafts.remove(&request.run_id).unwrap_or_default();
        let assembled = assemble(&drafts, &request.sections);
        for name in &assembled.missing {
            tracing::warn!(run_id = %request.run_id, section = %name, "No draft for section; skipping");
        }
        tracing::info!(
            run_id = %request.run_id,
            sections = request.sections.len() - assembled.missing.len(),
            citations = assembled.citations.len(),
            "Assembling report"
        );

        let body = self
            .polish(post_process(&assembled.body, &request.sections), cancel)
            .await;
        FinalReport {
            content: format!("# {} Survey Report\n\n{}", request.topic, body),
            topic: request.topic,
            references: assembled.citations,
        }
    }
}

#[async_trait]
impl Handler for AssemblerStage {
    async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> Result<()> {
        match message {
            Message::SectionDraft(draft) => self.collect_draft(draft),
            Message::Assemble(request) => {
                let report = self.build_report(request, &ctx.cancel).await;
                ctx.publish(Topic::Coordinator, report)?;
            }
            other => tracing::warn!(kind = other.kind(), "Assembler ignoring unexpected message"),
        }
        Ok(())
    }
}
