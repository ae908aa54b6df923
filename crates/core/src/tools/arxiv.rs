//! # Item Search
//!
//! The document-source collaborator: arXiv's Atom API, plus a
//! content-addressed on-disk cache in front of any [`ItemSearch`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::swarm::messages::{Item, ItemMetadata};

const ARXIV_API_URL: &str = "http://export.arxiv.org/api/query";

/// External search capability
#[async_trait]
pub trait ItemSearch: Send + Sync {
    /// Up to `max_count` items matching `keyword`, newest first
    async fn search(&self, keyword: &str, max_count: usize) -> Result<Vec<Item>>;
}

/// arXiv Atom API client
pub struct ArxivSearch {
    client: reqwest::Client,
    endpoint: String,
}

impl ArxivSearch {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build arXiv HTTP client")?;
        Ok(Self {
            client,
            endpoint: ARXIV_API_URL.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn query_url(&self, keyword: &str, max_count: usize) -> String {
        format!(
            "{}?search_query={}&start=0&max_results={}&sortBy=submittedDate&sortOrder=descending",
            self.endpoint,
            urlencoding::encode(&format!("all:{}", keyword)),
            max_count
        )
    }
}

#[async_trait]
impl ItemSearch for ArxivSearch {
    async fn search(&self, keyword: &str, max_count: usize) -> Result<Vec<Item>> {
        let url = self.query_url(keyword, max_count);
        tracing::info!(keyword, max_count, "Searching arXiv");

        let resp = self
            .client
            .get(&url)
            .header("User-Agent", "survey-pipeline/0.1")
            .send()
            .await
            .context("arXiv request failed")?
            .error_for_status()
            .context("arXiv returned an error status")?;

        let bytes = resp.bytes().await.context("Failed to read arXiv response")?;
        let mut items = parse_feed(&bytes)?;
        items.truncate(max_count);

        tracing::info!(keyword, found = items.len(), "arXiv search complete");
        Ok(items)
    }
}

/// Parse an arXiv Atom response into items
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<Item>> {
    let feed = feed_rs::parser::parse(bytes).context("Failed to parse arXiv Atom feed")?;

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| {
            let id = entry
                .id
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(&entry.id)
                .to_string();
            let url = entry
                .links
                .iter()
                .find(|l| l.rel.as_deref() == Some("alternate"))
                .or_else(|| entry.links.first())
                .map(|l| l.href.clone())
                .unwrap_or_else(|| entry.id.clone());

            Item {
                title: entry.title.map(|t| flatten(&t.content)).unwrap_or_default(),
                body: entry.summary.map(|t| flatten(&t.content)).unwrap_or_default(),
                metadata: ItemMetadata {
                    authors: entry.authors.into_iter().map(|a| a.name).collect(),
                    published: entry
                        .published
                        .or(entry.updated)
                        .map(|d| d.format("%Y-%m-%d").to_string())
                        .unwrap_or_default(),
                    url,
                    categories: entry.categories.into_iter().map(|c| c.term).collect(),
                },
                id,
            }
        })
        .collect())
}

fn flatten(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Cache
// ============================================================================

/// Content-addressed JSON cache keyed by `sha256(keyword|max_count)`
pub struct CachedSearch<S> {
    inner: S,
    dir: PathBuf,
}

impl<S: ItemSearch> CachedSearch<S> {
    pub fn new(inner: S, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: dir.into(),
        }
    }

    pub fn cache_path(&self, keyword: &str, max_count: usize) -> PathBuf {
        self.dir.join(format!("search_{}.json", cache_key(keyword, max_count)))
    }
}

pub fn cache_key(keyword: &str, max_count: usize) -> String {
    hex::encode(Sha256::digest(format!("{}|{}", keyword, max_count).as_bytes()))
}

async fn read_cached(path: &Path) -> Option<Vec<Item>> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&raw) {
        Ok(items) => Some(items),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt search cache");
            None
        }
    }
}

#[async_trait]
impl<S: ItemSearch> ItemSearch for CachedSearch<S> {
    async fn search(&self, keyword: &str, max_count: usize) -> Result<Vec<Item>> {
        let path = self.cache_path(keyword, max_count);
        if let Some(items) = read_cached(&path).await {
            tracing::info!(keyword, items = items.len(), "Loaded search from cache");
            return Ok(items);
        }

        let items = self.inner.search(keyword, max_count).await?;

        let write = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&path, serde_json::to_vec_pretty(&items)?).await?;
            anyhow::Ok(())
        };
        if let Err(e) = write.await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write search cache");
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>arXiv Query</title>
  <id>http://arxiv.org/api/query</id>
  <updated>2024-05-02T00:00:00Z</updated>
  <entry>
    <id>http://arxiv.org/abs/2405.00001v2</id>
    <updated>2024-05-02T10:00:00Z</updated>
    <published>2024-05-01T09:30:00Z</published>
    <title>Agents That
      Plan</title>
    <summary>  We study planning
  in language agents.  </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/abs/2405.00001v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2405.00001v2" rel="related" type="application/pdf"/>
    <category term="cs.AI" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed() {
        let items = parse_feed(SAMPLE.as_bytes()).unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.id, "2405.00001v2");
        assert_eq!(item.title, "Agents That Plan");
        assert_eq!(item.body, "We study planning in language agents.");
        assert_eq!(item.metadata.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(item.metadata.published, "2024-05-01");
        assert_eq!(item.metadata.url, "http://arxiv.org/abs/2405.00001v2");
        assert_eq!(item.metadata.categories, vec!["cs.AI", "cs.CL"]);
    }

    #[test]
    fn test_query_url_is_encoded() {
        let search = ArxivSearch::new().unwrap();
        let url = search.query_url("multi agent", 5);
        assert!(url.contains("search_query=all%3Amulti%20agent"));
        assert!(url.contains("max_results=5"));
        assert!(url.contains("sortBy=submittedDate"));
    }

    struct CountingSearch {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ItemSearch for CountingSearch {
        async fn search(&self, keyword: &str, max_count: usize) -> Result<Vec<Item>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..max_count)
                .map(|i| Item {
                    id: format!("{}-{}", keyword, i),
                    title: format!("Paper {}", i),
                    body: "abstract".into(),
                    metadata: ItemMetadata::default(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_inner_search() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cached = CachedSearch::new(
            CountingSearch {
                calls: Arc::clone(&calls),
            },
            dir.path().join("items"),
        );

        let first = cached.search("rag", 2).await.unwrap();
        let second = cached.search("rag", 2).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cached.cache_path("rag", 2).exists());

        // A different max count is a different key
        cached.search("rag", 3).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(cache_key("rag", 2), cache_key("rag", 3));
    }
}
