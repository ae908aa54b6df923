//! # Report Sink
//!
//! Persistence of the final report: a timestamped markdown file with a
//! references footer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

/// External persistence collaborator
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Store the report and return where it went
    async fn save(&self, topic: &str, content: &str, references: &[String]) -> Result<PathBuf>;
}

/// Writes `<dir>/<YYYYmmdd_HHMMSS>_<topic>.md`
pub struct FileReportSink {
    dir: PathBuf,
}

impl FileReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_name(topic: &str) -> String {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        format!("{}_{}.md", stamp, sanitize(topic))
    }
}

/// Report body followed by the references footer
pub fn render_report(content: &str, references: &[String]) -> String {
    format!(
        "{}\n\n---\n\n## References\n\n{}\n",
        content.trim_end(),
        references.join("\n")
    )
}

fn sanitize(topic: &str) -> String {
    let cleaned: String = topic
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "report".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl ReportSink for FileReportSink {
    async fn save(&self, topic: &str, content: &str, references: &[String]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.dir.join(Self::file_name(topic));
        tokio::fs::write(&path, render_report(content, references))
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;

        tracing::info!(path = %path.display(), references = references.len(), "Report written");
        Ok(path)
    }
}
