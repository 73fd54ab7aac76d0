//! Similarity retrieval: remote vector search or cosine over stored embeddings.

use std::sync::Arc;

use async_trait::async_trait;
use gmr_core::EmbeddingSourceType;
use gmr_storage::{EmbeddingStore, HttpError, JsonHttpClient, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityHit {
    pub opportunity_id: Uuid,
    /// In [0, 1].
    pub similarity: f64,
}

#[derive(Debug, Error)]
pub enum SimilarityError {
    #[error("similarity service: {0}")]
    Http(#[from] HttpError),
    #[error("embedding store: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid similarity response: {0}")]
    InvalidResponse(String),
}

/// Candidate opportunities for one organization, best first. An empty list
/// means no embeddings exist and the caller should fall back to degraded scoring.
#[async_trait]
pub trait SimilarityProvider: Send + Sync {
    async fn similar_opportunities(
        &self,
        organization_id: Uuid,
        profile_text: &str,
        limit: usize,
    ) -> Result<Vec<SimilarityHit>, SimilarityError>;
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    text: &'a str,
    source_type: &'static str,
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Debug, Deserialize)]
struct QueryMatch {
    source_id: Uuid,
    score: f64,
}

/// Vector search behind an HTTP endpoint accepting `POST {base}/query`.
#[derive(Debug, Clone)]
pub struct HttpSimilarityProvider {
    client: JsonHttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl HttpSimilarityProvider {
    pub fn new(client: JsonHttpClient, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl SimilarityProvider for HttpSimilarityProvider {
    async fn similar_opportunities(
        &self,
        organization_id: Uuid,
        profile_text: &str,
        limit: usize,
    ) -> Result<Vec<SimilarityHit>, SimilarityError> {
        let url = format!("{}/query", self.base_url);
        let response: QueryResponse = self
            .client
            .post_json(
                &url,
                self.api_key.as_deref(),
                &QueryRequest {
                    text: profile_text,
                    source_type: EmbeddingSourceType::Opportunity.as_str(),
                    top_k: limit,
                },
            )
            .await?;

        let mut hits = Vec::with_capacity(response.matches.len());
        for m in response.matches {
            if !m.score.is_finite() {
                return Err(SimilarityError::InvalidResponse(format!(
                    "non-finite score for {}",
                    m.source_id
                )));
            }
            hits.push(SimilarityHit {
                opportunity_id: m.source_id,
                similarity: m.score.clamp(0.0, 1.0),
            });
        }
        sort_and_truncate(&mut hits, limit);
        debug!(%organization_id, hits = hits.len(), "similarity query returned");
        Ok(hits)
    }
}

/// Brute-force cosine over embeddings persisted by this service.
#[derive(Clone)]
pub struct StoredVectorSimilarity {
    store: Arc<dyn EmbeddingStore>,
    scan_limit: usize,
}

impl StoredVectorSimilarity {
    pub fn new(store: Arc<dyn EmbeddingStore>, scan_limit: usize) -> Self {
        Self { store, scan_limit }
    }
}

#[async_trait]
impl SimilarityProvider for StoredVectorSimilarity {
    async fn similar_opportunities(
        &self,
        organization_id: Uuid,
        _profile_text: &str,
        limit: usize,
    ) -> Result<Vec<SimilarityHit>, SimilarityError> {
        let Some(org_vector) = self
            .store
            .get_embedding(EmbeddingSourceType::Organization, organization_id)
            .await?
        else {
            return Ok(Vec::new());
        };

        let candidates = self
            .store
            .embeddings_of_type(EmbeddingSourceType::Opportunity, self.scan_limit)
            .await?;
        let mut hits = candidates
            .iter()
            .filter(|c| c.model == org_vector.model)
            .filter_map(|c| {
                cosine_similarity(&org_vector.vector, &c.vector).map(|sim| SimilarityHit {
                    opportunity_id: c.source_id,
                    similarity: sim.clamp(0.0, 1.0),
                })
            })
            .collect::<Vec<_>>();
        sort_and_truncate(&mut hits, limit);
        Ok(hits)
    }
}

/// `None` for mismatched dimensions or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0f64, 0f64, 0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

fn sort_and_truncate(hits: &mut Vec<SimilarityHit>, limit: usize) {
    hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    hits.truncate(limit);
}
