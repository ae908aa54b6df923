//! # Collector Stage
//!
//! Entry point of a run: searches for source items, announces how many
//! grades the coordinator should wait for, then hands the items to the
//! summarizer.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::swarm::bus::{Handler, HandlerContext};
use crate::swarm::messages::{ItemBatch, ItemRequest, Message, RunPlan, Topic};
use crate::tools::ItemSearch;

pub struct CollectorStage {
    search: Arc<dyn ItemSearch>,
}

impl CollectorStage {
    pub fn new(search: Arc<dyn ItemSearch>) -> Self {
        Self { search }
    }

    async fn collect(&self, request: ItemRequest, ctx: &HandlerContext) -> Result<()> {
        tracing::info!(keyword = %request.keyword, max = request.max_count, "Collecting items");

        let items = match self.search.search(&request.keyword, request.max_count).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(keyword = %request.keyword, error = %format!("{:#}", e), "Search failed; continuing with no items");
                Vec::new()
            }
        };

        // The plan goes out first so the coordinator knows the total before any grade
        ctx.publish(
            Topic::Coordinator,
            RunPlan {
                run_topic: request.keyword.clone(),
                total: items.len(),
            },
        )?;
        tracing::info!(run = %request.keyword, items = items.len(), "Items collected");

        ctx.publish(
            Topic::Summarizer,
            ItemBatch {
                run: request.keyword,
                items,
            },
        )?;
        Ok(())
    }
}

#[async_trait]
impl Handler for CollectorStage {
    async fn handle(&mut self, message: Message, ctx: &HandlerContext) -> Result<()> {
        match message {
            Message::ItemRequest(request) => self.collect(request, ctx).await,
            other => {
                tracing::warn!(kind = other.kind(), "Collector ignoring unexpected message");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::bus::MessageBus;
    use crate::swarm::messages::{Item, ItemMetadata};
    use std::sync::Mutex;

    struct FixedSearch {
        fail: bool,
    }

    #[async_trait]
    impl ItemSearch for FixedSearch {
        async fn search(&self, keyword: &str, max_count: usize) -> Result<Vec<Item>> {
            if self.fail {
                anyhow::bail!("arXiv unavailable");
            }
            Ok((0..max_count.min(2))
                .map(|i| Item {
                    id: format!("{}-{}", keyword, i),
                    title: format!("Paper {}", i),
                    body: String::new(),
                    metadata: ItemMetadata::default(),
                })
                .collect())
        }
    }

    struct Recorder {
        seen: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&mut self, message: Message, _ctx: &HandlerContext) -> Result<()> {
            self.seen.lock().unwrap().push(message);
            Ok(())
        }
    }

    async fn collect(fail: bool, max_count: usize) -> (Vec<Message>, Vec<Message>) {
        let plans = Arc::new(Mutex::new(Vec::new()));
        let batches = Arc::new(Mutex::new(Vec::new()));
        let mut bus = MessageBus::new();
        bus.register(Topic::Collector, move || CollectorStage::new(Arc::new(FixedSearch { fail })))
            .unwrap();
        let seen = Arc::clone(&plans);
        bus.register(Topic::Coordinator, move || Recorder { seen }).unwrap();
        let seen = Arc::clone(&batches);
        bus.register(Topic::Summarizer, move || Recorder { seen }).unwrap();
        bus.start();

        bus.publish(
            Topic::Collector,
            ItemRequest {
                keyword: "rag".into(),
                max_count,
            },
        )
        .unwrap();
        bus.drain_until_idle().await;
        bus.shutdown().await;

        let plans = plans.lock().unwrap().clone();
        let batches = batches.lock().unwrap().clone();
        (plans, batches)
    }

    #[tokio::test]
    async fn test_plan_announces_item_count() {
        let (plans, batches) = collect(false, 5).await;

        assert_eq!(
            plans,
            vec![Message::RunPlan(RunPlan {
                run_topic: "rag".into(),
                total: 2
            })]
        );
        match &batches[..] {
            [Message::ItemBatch(batch)] => {
                assert_eq!(batch.run, "rag");
                assert_eq!(batch.items.len(), 2);
            }
            other => panic!("expected one item batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_search_becomes_empty_run() {
        let (plans, batches) = collect(true, 5).await;

        assert_eq!(
            plans,
            vec![Message::RunPlan(RunPlan {
                run_topic: "rag".into(),
                total: 0
            })]
        );
        assert!(matches!(&batches[..], [Message::ItemBatch(batch)] if batch.items.is_empty()));
    }
}
