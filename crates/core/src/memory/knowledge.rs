//! # Knowledge Store
//!
//! Change-aware adapter over an [`Embedder`] and a [`VectorStore`]. Stages
//! re-running the same logical item (a retried summary, a rewritten
//! section) only write what actually changed.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::embedder::Embedder;
use super::vector_store::{Metadata, ScoredDocument, VectorEntry, VectorStore};
use crate::error::{truncate_chars, StoreError};
use crate::llm::Tool;

/// Outcome of an upsert: unchanged entries skipped, new or changed written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub skipped: usize,
    pub written: usize,
}

/// Embedding plus storage, shared by every stage of a run
#[derive(Clone)]
pub struct KnowledgeStore {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl KnowledgeStore {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    /// Write the entries whose document is absent or differs from the stored one.
    ///
    /// Overlapping id sets are fine; ids not yet stored are always written.
    pub fn upsert_if_changed(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        documents: &[String],
        metadata: &[Metadata],
    ) -> Result<UpsertStats> {
        check_lengths(ids.len(), vectors.len(), documents.len(), metadata.len())?;

        let changed = self.changed_indices(ids, documents)?;
        let entries: Vec<VectorEntry> = changed
            .iter()
            .map(|&i| VectorEntry {
                id: ids[i].clone(),
                vector: vectors[i].clone(),
                document: documents[i].clone(),
                metadata: metadata[i].clone(),
            })
            .collect();

        self.store.upsert(&entries)?;
        Ok(UpsertStats {
            skipped: ids.len() - entries.len(),
            written: entries.len(),
        })
    }

    /// Like [`upsert_if_changed`](Self::upsert_if_changed), embedding only the changed documents
    pub async fn store_documents(
        &self,
        ids: &[String],
        documents: &[String],
        metadata: &[Metadata],
    ) -> Result<UpsertStats> {
        check_lengths(ids.len(), documents.len(), documents.len(), metadata.len())?;

        let changed = self.changed_indices(ids, documents)?;
        let mut entries = Vec::with_capacity(changed.len());
        for i in changed {
            entries.push(VectorEntry {
                id: ids[i].clone(),
                vector: self.embedder.embed(&documents[i]).await?,
                document: documents[i].clone(),
                metadata: metadata[i].clone(),
            });
        }

        self.store.upsert(&entries)?;
        let stats = UpsertStats {
            skipped: ids.len() - entries.len(),
            written: entries.len(),
        };
        tracing::debug!(skipped = stats.skipped, written = stats.written, "Knowledge upsert");
        Ok(stats)
    }

    /// Convenience for a single document
    pub async fn store_document(
        &self,
        id: impl Into<String>,
        document: impl Into<String>,
        metadata: Metadata,
    ) -> Result<UpsertStats> {
        self.store_documents(&[id.into()], &[document.into()], &[metadata])
            .await
    }

    /// Top `k` documents similar to `query`, restricted by `filter`
    pub async fn retrieve(&self, query: &str, k: usize, filter: &Metadata) -> Result<Vec<ScoredDocument>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query).await?;
        self.store.query(&vector, k, filter)
    }

    pub fn count(&self) -> Result<usize> {
        self.store.count()
    }

    fn changed_indices(&self, ids: &[String], documents: &[String]) -> Result<Vec<usize>> {
        let existing = self.store.get_documents(ids)?;
        Ok((0..ids.len())
            .filter(|&i| existing.get(&ids[i]) != Some(&documents[i]))
            .collect())
    }
}

fn check_lengths(ids: usize, vectors: usize, documents: usize, metadata: usize) -> Result<(), StoreError> {
    if ids == vectors && ids == documents && ids == metadata {
        Ok(())
    } else {
        Err(StoreError::LengthMismatch {
            ids,
            vectors,
            documents,
            metadata,
        })
    }
}

/// Build metadata from pairs
pub fn metadata<const N: usize>(pairs: [(&str, &str); N]) -> Metadata {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ============================================================================
// search_knowledge tool
// ============================================================================

/// `search_knowledge(query, top_k?, doc_type?)` for the writer's tool loop.
///
/// Section lookups are scoped to one run so drafts from earlier reports
/// never leak into the current one.
pub struct KnowledgeSearchTool {
    knowledge: KnowledgeStore,
    default_top_k: usize,
    run_id: Option<String>,
}

impl KnowledgeSearchTool {
    pub fn new(knowledge: KnowledgeStore, default_top_k: usize) -> Self {
        Self {
            knowledge,
            default_top_k: default_top_k.max(1),
            run_id: None,
        }
    }

    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "search_knowledge"
    }

    fn description(&self) -> &str {
        "Search the knowledge base of paper summaries, analyses and already written sections. \
         Returns the most relevant passages with their titles."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to look for"},
                "top_k": {"type": "integer", "description": "Number of passages to return"},
                "doc_type": {
                    "type": "string",
                    "enum": ["summary", "analysis", "section"],
                    "description": "Restrict to one kind of document"
                }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<String> {
        let query = args["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing query"))?;
        let top_k = args["top_k"]
            .as_u64()
            .map(|k| k.clamp(1, 20) as usize)
            .unwrap_or(self.default_top_k);

        let mut filter = Metadata::new();
        if let Some(doc_type) = args["doc_type"].as_str() {
            filter.insert("type".into(), doc_type.into());
            if doc_type == "section" {
                if let Some(run_id) = &self.run_id {
                    filter.insert("run_id".into(), run_id.clone());
                }
            }
        }

        let hits = self.knowledge.retrieve(query, top_k, &filter).await?;
        if hits.is_empty() {
            return Ok("No matching documents.".to_string());
        }

        Ok(hits
            .iter()
            .enumerate()
            .map(|(i, hit)| {
                let title = hit.metadata.get("title").map(String::as_str).unwrap_or(&hit.id);
                let kind = hit.metadata.get("type").map(String::as_str).unwrap_or("document");
                format!("[{}] {} ({})\n{}", i + 1, title, kind, truncate_chars(&hit.document, 500))
            })
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HashingEmbedder, KnowledgeDb, SqliteVectorStore};

    fn knowledge() -> (tempfile::TempDir, KnowledgeStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = KnowledgeDb::open_at(dir.path().join("knowledge.db")).unwrap();
        let store = KnowledgeStore::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(SqliteVectorStore::new(&db)),
        );
        (dir, store)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identical_upsert_is_skipped() {
        let (_dir, store) = knowledge();
        let ids = strings(&["p1-summary", "p2-summary", "p3-summary"]);
        let docs = strings(&["one", "two", "three"]);
        let vectors = vec![vec![1.0, 0.0]; 3];
        let meta = vec![metadata([("type", "summary")]); 3];

        let first = store.upsert_if_changed(&ids, &vectors, &docs, &meta).unwrap();
        assert_eq!(first, UpsertStats { skipped: 0, written: 3 });

        let second = store.upsert_if_changed(&ids, &vectors, &docs, &meta).unwrap();
        assert_eq!(second, UpsertStats { skipped: 3, written: 0 });
    }

    #[test]
    fn test_partial_overlap_writes_new_and_changed() {
        let (_dir, store) = knowledge();
        let vectors = vec![vec![1.0]; 2];
        let meta = vec![Metadata::new(); 2];
        store
            .upsert_if_changed(&strings(&["a", "b"]), &vectors, &strings(&["A", "B"]), &meta)
            .unwrap();

        let vectors = vec![vec![1.0]; 3];
        let meta = vec![Metadata::new(); 3];
        let stats = store
            .upsert_if_changed(
                &strings(&["b", "c", "a"]),
                &vectors,
                &strings(&["B", "C", "A changed"]),
                &meta,
            )
            .unwrap();
        assert_eq!(stats, UpsertStats { skipped: 1, written: 2 });
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let (_dir, store) = knowledge();
        let err = store
            .upsert_if_changed(&strings(&["a", "b"]), &[vec![1.0]], &strings(&["A", "B"]), &[])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::LengthMismatch { ids: 2, vectors: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_store_documents_and_retrieve() {
        let (_dir, store) = knowledge();
        let first = store
            .store_document("p1-summary", "transformers for protein folding", metadata([("type", "summary"), ("title", "Fold")]))
            .await
            .unwrap();
        assert_eq!(first.written, 1);
        let again = store
            .store_document("p1-summary", "transformers for protein folding", metadata([("type", "summary"), ("title", "Fold")]))
            .await
            .unwrap();
        assert_eq!(again, UpsertStats { skipped: 1, written: 0 });

        store
            .store_document("p2-analysis", "reinforcement learning in games", metadata([("type", "analysis")]))
            .await
            .unwrap();

        let hits = store
            .retrieve("protein folding", 5, &metadata([("type", "summary")]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "p1-summary");
    }

    #[tokio::test]
    async fn test_search_tool_scopes_sections_to_run() {
        let (_dir, store) = knowledge();
        store
            .store_document("section-r1-0", "intro of run one", metadata([("type", "section"), ("run_id", "r1")]))
            .await
            .unwrap();
        store
            .store_document("section-r2-0", "intro of run two", metadata([("type", "section"), ("run_id", "r2")]))
            .await
            .unwrap();

        let tool = KnowledgeSearchTool::new(store, 5).for_run("r2");
        let out = tool
            .call(serde_json::json!({"query": "intro", "doc_type": "section"}))
            .await
            .unwrap();
        assert!(out.contains("run two"));
        assert!(!out.contains("run one"));

        assert!(tool.call(serde_json::json!({})).await.is_err());
    }
}
