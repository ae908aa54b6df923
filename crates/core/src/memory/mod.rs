//! # Knowledge Memory
//!
//! Where per-item summaries, analyses and written sections live between
//! stages.
//!
//! ```text
//! Stage ──▶ KnowledgeStore ──▶ Embedder     (HashingEmbedder)
//!                 │
//!                 └──────────▶ VectorStore  (SqliteVectorStore ──▶ KnowledgeDb)
//! ```

pub mod db;
pub mod embedder;
pub mod knowledge;
pub mod vector_store;

pub use db::KnowledgeDb;
pub use embedder::{Embedder, HashingEmbedder};
pub use knowledge::{metadata, KnowledgeSearchTool, KnowledgeStore, UpsertStats};
pub use vector_store::{Metadata, ScoredDocument, SqliteVectorStore, VectorEntry, VectorStore};
