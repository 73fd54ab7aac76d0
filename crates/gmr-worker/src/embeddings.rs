//! Refreshes stale organization and opportunity vectors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gmr_core::{EmbeddingSourceType, EmbeddingVector};
use gmr_scoring::embedding::{opportunity_embedding_text, organization_embedding_text};
use gmr_scoring::{content_hash, EmbeddingGenerator};
use gmr_storage::{StorageResult, StoreSet};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_EMBEDDING_BATCH: usize = 32;
pub const DEFAULT_EMBEDDING_SCAN: usize = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmbeddingReport {
    pub generated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

pub struct EmbeddingBatchRunner {
    stores: StoreSet,
    generator: Arc<dyn EmbeddingGenerator>,
    batch_size: usize,
    scan_limit: usize,
}

struct PendingSource {
    id: Uuid,
    text: String,
    hash: String,
}

impl EmbeddingBatchRunner {
    pub fn new(stores: StoreSet, generator: Arc<dyn EmbeddingGenerator>) -> Self {
        Self {
            stores,
            generator,
            batch_size: DEFAULT_EMBEDDING_BATCH,
            scan_limit: DEFAULT_EMBEDDING_SCAN,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn run(&self, now: DateTime<Utc>) -> EmbeddingReport {
        let mut report = EmbeddingReport::default();
        for source_type in [EmbeddingSourceType::Organization, EmbeddingSourceType::Opportunity] {
            if let Err(err) = self.refresh_type(source_type, now, &mut report).await {
                warn!(source_type = source_type.as_str(), error = %err, "embedding scan failed");
                report.errors.push(format!("{}: {err}", source_type.as_str()));
            }
        }
        info!(
            generated = report.generated,
            unchanged = report.unchanged,
            failed = report.failed,
            "embedding refresh finished"
        );
        report
    }

    async fn refresh_type(
        &self,
        source_type: EmbeddingSourceType,
        now: DateTime<Utc>,
        report: &mut EmbeddingReport,
    ) -> StorageResult<()> {
        let stale = self
            .stores
            .embeddings
            .stale_embedding_sources(source_type, self.scan_limit)
            .await?;
        let model = self.generator.model().to_string();

        for ids in stale.chunks(self.batch_size) {
            let mut pending = Vec::with_capacity(ids.len());
            for (id, text) in self.source_texts(source_type, ids).await? {
                let hash = content_hash(&text);
                let existing = self.stores.embeddings.get_embedding(source_type, id).await?;
                match existing {
                    Some(mut current) if current.content_hash == hash && current.model == model => {
                        current.updated_at = now;
                        self.stores.embeddings.upsert_embedding(&current).await?;
                        report.unchanged += 1;
                    }
                    _ => pending.push(PendingSource { id, text, hash }),
                }
            }
            if pending.is_empty() {
                continue;
            }

            let inputs = pending.iter().map(|p| p.text.clone()).collect::<Vec<_>>();
            let vectors = match self.generator.embed(&inputs).await {
                Ok(vectors) => vectors,
                Err(err) => {
                    warn!(source_type = source_type.as_str(), count = pending.len(), error = %err, "embedding call failed");
                    report.failed += pending.len();
                    report.errors.push(err.to_string());
                    continue;
                }
            };
            for (source, vector) in pending.into_iter().zip(vectors) {
                self.stores
                    .embeddings
                    .upsert_embedding(&EmbeddingVector {
                        source_type,
                        source_id: source.id,
                        model: model.clone(),
                        content_hash: source.hash,
                        vector,
                        updated_at: now,
                    })
                    .await?;
                report.generated += 1;
            }
        }
        Ok(())
    }

    async fn source_texts(
        &self,
        source_type: EmbeddingSourceType,
        ids: &[Uuid],
    ) -> StorageResult<Vec<(Uuid, String)>> {
        match source_type {
            EmbeddingSourceType::Organization => {
                let mut texts = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(profile) = self.stores.directory.organization_profile(*id).await? {
                        texts.push((*id, organization_embedding_text(&profile)));
                    }
                }
                Ok(texts)
            }
            EmbeddingSourceType::Opportunity => Ok(self
                .stores
                .catalog
                .opportunities_by_ids(ids)
                .await?
                .iter()
                .map(|o| (o.id, opportunity_embedding_text(o)))
                .collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use gmr_core::{OpportunityRecord, OrganizationProfile};
    use gmr_scoring::EmbeddingError;
    use gmr_storage::{EmbeddingStore, MemoryStore, OrganizationDirectory};

    use super::*;

    struct LengthEmbedder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingGenerator for LengthEmbedder {
        fn model(&self) -> &str {
            "test-model"
        }

        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EmbeddingError::Empty);
            }
            Ok(inputs.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    async fn seeded() -> (Arc<MemoryStore>, Uuid, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let org = OrganizationProfile {
            id: Uuid::new_v4(),
            name: "한빛테크".into(),
            description: Some("AI 품질검사".into()),
            ..Default::default()
        };
        let opp = OpportunityRecord {
            id: Uuid::new_v4(),
            title: "스마트공장 지원사업".into(),
            organizer: None,
            category: Some("기술".into()),
            sub_category: None,
            eligibility_text: None,
            description: "제조 AI".into(),
            region: None,
            min_amount: None,
            max_amount: None,
            deadline: None,
            is_permanent: true,
            posted_at: None,
        };
        let ids = (org.id, opp.id);
        store.insert_organization(org).await;
        store.insert_opportunity(opp).await;
        (store, ids.0, ids.1)
    }

    #[tokio::test]
    async fn generates_missing_vectors_then_skips_unchanged_text() {
        let (store, org_id, opp_id) = seeded().await;
        let embedder = Arc::new(LengthEmbedder {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let runner = EmbeddingBatchRunner::new(StoreSet::shared(store.clone()), embedder.clone());

        let first = runner.run(Utc::now()).await;
        assert_eq!(first.generated, 2);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        let org_vec = store
            .get_embedding(EmbeddingSourceType::Organization, org_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(org_vec.model, "test-model");
        assert!(store
            .get_embedding(EmbeddingSourceType::Opportunity, opp_id)
            .await
            .unwrap()
            .is_some());

        // Touch the source without changing its text.
        let profile = store.organization_profile(org_id).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.insert_organization(profile).await;

        let second = runner.run(Utc::now()).await;
        assert_eq!(second.generated, 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn generator_failure_is_counted_not_fatal() {
        let (store, _, _) = seeded().await;
        let runner = EmbeddingBatchRunner::new(
            StoreSet::shared(store),
            Arc::new(LengthEmbedder {
                calls: AtomicUsize::new(0),
                fail: true,
            }),
        );
        let report = runner.run(Utc::now()).await;
        assert_eq!(report.generated, 0);
        assert_eq!(report.failed, 2);
        assert_eq!(report.errors.len(), 2);
    }
}
