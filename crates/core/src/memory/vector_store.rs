//! # Vector Store
//!
//! Storage half of the knowledge store: documents with embeddings and
//! string metadata, ranked by cosine similarity.

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::db::KnowledgeDb;
use super::embedder::cosine_similarity;
use crate::error::StoreError;

/// Flat string metadata attached to a document
pub type Metadata = BTreeMap<String, String>;

/// One entry to write
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub document: String,
    pub metadata: Metadata,
}

/// A query hit, best first
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    pub score: f32,
}

/// External retrieval backend
pub trait VectorStore: Send + Sync {
    /// Stored documents for the ids that exist; missing ids are absent from the map
    fn get_documents(&self, ids: &[String]) -> Result<HashMap<String, String>>;

    /// Insert or replace entries by id
    fn upsert(&self, entries: &[VectorEntry]) -> Result<()>;

    /// Top `k` documents whose metadata contains every `filter` pair
    fn query(&self, vector: &[f32], k: usize, filter: &Metadata) -> Result<Vec<ScoredDocument>>;

    fn count(&self) -> Result<usize>;
}

/// [`VectorStore`] on the shared knowledge connection
pub struct SqliteVectorStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVectorStore {
    pub fn new(db: &KnowledgeDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }
}

impl VectorStore for SqliteVectorStore {
    fn get_documents(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.lock()?;

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id, document FROM documents WHERE id IN ({})", placeholders);
        let mut stmt = conn.prepare(&sql)?;

        let found = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()
            .context("Failed to read stored documents")?;

        Ok(found)
    }

    fn upsert(&self, entries: &[VectorEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO documents (id, document, embedding, metadata, updated_at)
                VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
                ON CONFLICT(id) DO UPDATE SET
                    document = excluded.document,
                    embedding = excluded.embedding,
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                "#,
            )?;
            for entry in entries {
                let metadata = serde_json::to_string(&entry.metadata)?;
                stmt.execute(params![
                    entry.id,
                    entry.document,
                    encode_vector(&entry.vector),
                    metadata
                ])
                .with_context(|| format!("Failed to upsert document {}", entry.id))?;
            }
        }
        tx.commit().context("Failed to commit upsert")?;
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize, filter: &Metadata) -> Result<Vec<ScoredDocument>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, document, embedding, metadata FROM documents")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to scan documents")?;

        let mut hits: Vec<ScoredDocument> = rows
            .into_iter()
            .filter_map(|(id, document, blob, metadata)| {
                let metadata: Metadata = serde_json::from_str(&metadata).unwrap_or_default();
                matches_filter(&metadata, filter).then(|| ScoredDocument {
                    score: cosine_similarity(vector, &decode_vector(&blob)),
                    id,
                    document,
                    metadata,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn entry(id: &str, vector: Vec<f32>, doc: &str, metadata: Metadata) -> VectorEntry {
        VectorEntry {
            id: id.into(),
            vector,
            document: doc.into(),
            metadata,
        }
    }

    #[test]
    fn test_vector_blob_encoding() {
        let v = vec![0.5, -1.25, 3.0];
        assert_eq!(decode_vector(&encode_vector(&v)), v);
    }

    #[test]
    fn test_upsert_query_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let db = KnowledgeDb::open_at(dir.path().join("k.db")).unwrap();
        let store = SqliteVectorStore::new(&db);

        store
            .upsert(&[
                entry("a", vec![1.0, 0.0], "alpha", meta(&[("type", "summary")])),
                entry("b", vec![0.9, 0.1], "beta", meta(&[("type", "analysis")])),
                entry("c", vec![0.0, 1.0], "gamma", meta(&[("type", "summary")])),
            ])
            .unwrap();
        assert_eq!(store.count().unwrap(), 3);

        let all = store.query(&[1.0, 0.0], 2, &Metadata::new()).unwrap();
        assert_eq!(all.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let summaries = store.query(&[1.0, 0.0], 5, &meta(&[("type", "summary")])).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, "a");
        assert_eq!(summaries[1].id, "c");

        // Replace by id
        store
            .upsert(&[entry("a", vec![1.0, 0.0], "alpha v2", meta(&[("type", "summary")]))])
            .unwrap();
        assert_eq!(store.count().unwrap(), 3);

        let docs = store
            .get_documents(&["a".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs["a"], "alpha v2");
    }
}
