//! # Survey Core
//!
//! Orchestration core of the survey pipeline: stages that talk only
//! through typed messages on an in-process bus, a coordinator that decides
//! when a run's grades are complete, retrying text generation, a
//! change-aware knowledge store and an order-stable section assembler.
//!
//! ## Architecture
//!
//! - `swarm/` - Message bus, messages, coordinator and the pipeline driver
//! - `skills/` - Stage handlers (collector through assembler) and prompts
//! - `llm/` - Text generation backends, retry policy and the tool loop
//! - `memory/` - Embeddings and the SQLite-backed knowledge store
//! - `tools/` - Item search and report persistence
//! - `models/` - LLM provider configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use survey_core::swarm::{Collaborators, ResearchPipeline};
//!
//! let pipeline = ResearchPipeline::new(PipelineConfig::from_env(), collaborators);
//! let outcome = pipeline.run("retrieval augmented generation", 20).await?;
//! for report in outcome.reports {
//!     println!("{}", report.path.display());
//! }
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod models;
pub mod skills;
pub mod swarm;
pub mod tools;

pub use config::PipelineConfig;
pub use error::{BusError, CallFailure, StoreError};
