//! Text embedding generation and the texts embedded for each source type.

use async_trait::async_trait;
use gmr_core::{OpportunityRecord, OrganizationProfile};
use gmr_storage::{HttpError, JsonHttpClient};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding service: {0}")]
    Http(#[from] HttpError),
    #[error("expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("embedding service returned an empty vector")]
    Empty,
}

#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    fn model(&self) -> &str;

    /// One vector per input, in input order.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `POST /embeddings` client.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingGenerator {
    client: JsonHttpClient,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpEmbeddingGenerator {
    pub fn new(
        client: JsonHttpClient,
        url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingGenerator for HttpEmbeddingGenerator {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let response: EmbeddingResponse = self
            .client
            .post_json(
                &self.url,
                self.api_key.as_deref(),
                &EmbeddingRequest {
                    model: &self.model,
                    input: inputs,
                },
            )
            .await?;
        if response.data.len() != inputs.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: inputs.len(),
                actual: response.data.len(),
            });
        }
        let vectors = response
            .data
            .into_iter()
            .map(|d| d.embedding)
            .collect::<Vec<_>>();
        if vectors.iter().any(Vec::is_empty) {
            return Err(EmbeddingError::Empty);
        }
        Ok(vectors)
    }
}

/// Lowercase hex sha256, used to skip re-embedding unchanged text.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub fn organization_embedding_text(profile: &OrganizationProfile) -> String {
    profile.profile_text()
}

pub fn opportunity_embedding_text(opportunity: &OpportunityRecord) -> String {
    [
        Some(opportunity.title.as_str()),
        opportunity.organizer.as_deref(),
        opportunity.category.as_deref(),
        opportunity.sub_category.as_deref(),
        opportunity.eligibility_text.as_deref(),
        Some(opportunity.description.as_str()),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn content_hash_is_stable_hex() {
        let a = content_hash("스마트 공장 구축 지원");
        assert_eq!(a.len(), 64);
        assert_eq!(a, content_hash("스마트 공장 구축 지원"));
        assert_ne!(a, content_hash("스마트 공장 구축 지원 "));
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn opportunity_text_skips_blank_fields() {
        let opp = OpportunityRecord {
            id: Uuid::new_v4(),
            title: "수출 바우처".into(),
            organizer: Some("  ".into()),
            category: Some("수출".into()),
            sub_category: None,
            eligibility_text: None,
            description: "해외 판로 개척".into(),
            region: None,
            min_amount: None,
            max_amount: None,
            deadline: None,
            is_permanent: true,
            posted_at: None,
        };
        assert_eq!(opportunity_embedding_text(&opp), "수출 바우처\n수출\n해외 판로 개척");
    }
}
