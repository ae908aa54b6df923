//! Default prompt templates bundled at compile time.

/// Summarizer - extracts problem, method and value as strict JSON
pub const SUMMARIZER: &str = include_str!("defaults/summarizer.md");

/// Analyzer - in-depth analysis ending in a key concepts line
pub const ANALYZER: &str = include_str!("defaults/analyzer.md");

/// Section writer - drafts one chapter body
pub const SECTION_WRITER: &str = include_str!("defaults/section_writer.md");

/// Section planner - keywords and document types for a chapter (JSON)
pub const SECTION_PLANNER: &str = include_str!("defaults/section_planner.md");

/// Section reviser - consistency pass over a drafted chapter
pub const SECTION_REVISER: &str = include_str!("defaults/section_reviser.md");

/// Report writer - whole report in one generation
pub const REPORT_WRITER: &str = include_str!("defaults/report_writer.md");

/// Report polisher - final editing pass in the assembler
pub const REPORT_POLISHER: &str = include_str!("defaults/report_polisher.md");

/// Line prefix the analyzer is asked to end with
pub const KEY_CONCEPTS_PREFIX: &str = "Key concepts:";

/// All default prompts with their slugs
pub fn all_defaults() -> Vec<(&'static str, &'static str)> {
    vec![
        ("summarizer", SUMMARIZER),
        ("analyzer", ANALYZER),
        ("section_writer", SECTION_WRITER),
        ("section_planner", SECTION_PLANNER),
        ("section_reviser", SECTION_REVISER),
        ("report_writer", REPORT_WRITER),
        ("report_polisher", REPORT_POLISHER),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_prompts_non_empty() {
        for (slug, content) in all_defaults() {
            assert!(!content.is_empty(), "Prompt '{}' should not be empty", slug);
            assert!(content.len() > 50, "Prompt '{}' seems too short", slug);
        }
    }

    #[test]
    fn test_analyzer_prompt_names_concepts_line() {
        assert!(ANALYZER.contains(KEY_CONCEPTS_PREFIX));
    }
}
