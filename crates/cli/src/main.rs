//! Survey CLI
//!
//! Runs the survey pipeline for one topic and prints where the report was
//! written.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use survey_core::memory::{HashingEmbedder, KnowledgeDb, KnowledgeStore, SqliteVectorStore};
use survey_core::skills::{AutoReject, ReviewRequest, Reviewer};
use survey_core::swarm::{Collaborators, ResearchPipeline};
use survey_core::tools::{ArxivSearch, CachedSearch, FileReportSink};
use survey_core::PipelineConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Survey - write a literature survey for a research topic")]
struct Args {
    /// Research topic; asked for on stdin when omitted
    topic: Option<String>,

    /// Maximum number of papers to collect
    #[arg(long, env = "SURVEY_MAX_ITEMS")]
    max_items: Option<usize>,

    /// Write the whole report in one generation instead of section by section
    #[arg(long)]
    single_shot: bool,

    /// Ask on stdin before approving high-risk papers (default: reject them)
    #[arg(long)]
    interactive: bool,

    /// Environment file to load before reading settings
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

/// Asks the operator about each high-risk paper
struct StdinReviewer;

#[async_trait]
impl Reviewer for StdinReviewer {
    async fn review(&self, request: &ReviewRequest) -> bool {
        let prompt = format!(
            "\n⚠️  High-risk paper (score {:.1}): {}\n   {}\nApprove? [y/N] ",
            request.risk_score, request.title, request.excerpt
        );
        let answer = tokio::task::spawn_blocking(move || {
            print!("{}", prompt);
            std::io::stdout().flush().ok();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            _ => {
                tracing::warn!(item_id = %request.item_id, "Could not read review answer; rejecting");
                false
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("survey_core=info,survey=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn read_topic() -> Result<String> {
    print!("Research topic: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read topic from stdin")?;
    Ok(line.trim().to_string())
}

fn collaborators(config: &PipelineConfig, interactive: bool) -> Result<Collaborators> {
    let db = KnowledgeDb::open_at(config.knowledge_db_path())?;
    let knowledge = KnowledgeStore::new(
        Arc::new(HashingEmbedder::default()),
        Arc::new(SqliteVectorStore::new(&db)),
    );
    let search = CachedSearch::new(ArxivSearch::new()?, config.items_cache_dir());
    let reviewer: Arc<dyn Reviewer> = if interactive {
        Arc::new(StdinReviewer)
    } else {
        Arc::new(AutoReject)
    };

    Ok(Collaborators {
        generator: config.model.create_generator()?,
        search: Arc::new(search),
        knowledge,
        sink: Arc::new(FileReportSink::new(config.reports_dir())),
        reviewer,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if dotenvy::from_path(&args.env_file).is_ok() {
        println!("📄 Loaded {}", args.env_file.display());
    }
    init_tracing();

    let topic = match args.topic {
        Some(topic) => topic,
        None => read_topic()?,
    };
    if topic.is_empty() {
        anyhow::bail!("No research topic given");
    }

    let mut config = PipelineConfig::from_env();
    if args.single_shot {
        config.section_flow = false;
    }
    let max_items = args.max_items.unwrap_or(config.max_items);

    for dir in [config.items_cache_dir(), config.reports_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    println!("🚀 Surveying \"{}\" (up to {} papers)", topic, max_items);
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling pending generations");
            ctrl_c.cancel();
        }
    });

    let pipeline = ResearchPipeline::new(config.clone(), collaborators(&config, args.interactive)?)
        .with_cancellation(cancel);
    let outcome = pipeline.run(&topic, max_items).await?;

    if outcome.reports.is_empty() {
        eprintln!("❌ No report was produced; see the log for details");
        std::process::exit(1);
    }
    for report in &outcome.reports {
        println!(
            "✅ Report saved: {} ({} references)",
            report.path.display(),
            report.references
        );
    }
    Ok(())
}
