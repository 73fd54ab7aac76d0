//! Persistence contracts, PostgreSQL + in-memory stores, and HTTP plumbing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gmr_core::{
    ConfidenceTier, EmbeddingSourceType, EmbeddingVector, Feedback, MatchingPreference,
    MatchingResult, MemberRole, NotificationSettings, OpportunityRecord, OrganizationProfile,
    PreferenceInput, ScoreResult,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{BackoffPolicy, HttpClientConfig, HttpError, JsonHttpClient};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "gmr-storage";

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {table} row: {message}")]
    CorruptRow { table: &'static str, message: String },
    #[error("{0} not found")]
    NotFound(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: Some(page),
            per_page: Some(per_page),
        }
    }

    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> u32 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.per_page())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: u64) -> Self {
        let per_page = request.per_page();
        Self {
            items,
            page: request.page(),
            per_page,
            total,
            total_pages: total.max(1).div_ceil(u64::from(per_page)),
        }
    }
}

/// Whole-row write for one scored pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultWrite {
    pub organization_id: Uuid,
    pub opportunity_id: Uuid,
    pub user_id: Uuid,
    pub score: ScoreResult,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ResultFilter {
    #[serde(default)]
    pub min_confidence: Option<ConfidenceTier>,
}

impl ResultFilter {
    pub fn allowed_tiers(&self) -> Vec<ConfidenceTier> {
        let floor = self.min_confidence.unwrap_or(ConfidenceTier::Low);
        [ConfidenceTier::Low, ConfidenceTier::Medium, ConfidenceTier::High]
            .into_iter()
            .filter(|tier| *tier >= floor)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultStats {
    pub total_results: u64,
    pub refreshed_since: u64,
    pub organizations_with_results: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub degraded: u64,
}

/// A user who opted into digests, with the organizations they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestRecipient {
    pub settings: NotificationSettings,
    pub organization_ids: Vec<Uuid>,
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get_preference(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> StorageResult<Option<MatchingPreference>>;

    /// Every member's preference for an organization, most recently updated first.
    async fn preferences_for_organization(
        &self,
        organization_id: Uuid,
    ) -> StorageResult<Vec<MatchingPreference>>;

    async fn upsert_preference(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        input: &PreferenceInput,
        now: DateTime<Utc>,
    ) -> StorageResult<MatchingPreference>;

    async fn delete_preference(&self, user_id: Uuid, organization_id: Uuid) -> StorageResult<bool>;
}

#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    /// Organizations with at least one preference and at least one member.
    async fn eligible_organization_ids(&self) -> StorageResult<Vec<Uuid>>;

    async fn organization_profile(&self, organization_id: Uuid)
        -> StorageResult<Option<OrganizationProfile>>;

    async fn member_count(&self, organization_id: Uuid) -> StorageResult<u64>;

    async fn member_role(&self, user_id: Uuid, organization_id: Uuid)
        -> StorageResult<Option<MemberRole>>;
}

#[async_trait]
pub trait OpportunityCatalog: Send + Sync {
    async fn opportunities_by_ids(&self, ids: &[Uuid]) -> StorageResult<Vec<OpportunityRecord>>;

    /// Active opportunities that are still open on `today`, newest first.
    async fn open_opportunities(
        &self,
        today: NaiveDate,
        limit: usize,
    ) -> StorageResult<Vec<OpportunityRecord>>;
}

/// Single writer of `matching_results` rows.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Atomic insert-or-replace keyed by (organization, opportunity). Score
    /// columns are replaced as a whole; feedback columns are left untouched.
    async fn upsert_result(&self, write: &ResultWrite) -> StorageResult<Uuid>;

    async fn get_result(&self, result_id: Uuid) -> StorageResult<Option<MatchingResult>>;

    async fn list_results(
        &self,
        organization_id: Uuid,
        filter: ResultFilter,
        page: PageRequest,
    ) -> StorageResult<Page<MatchingResult>>;

    async fn set_feedback(&self, result_id: Uuid, feedback: &Feedback) -> StorageResult<bool>;

    async fn results_created_between(
        &self,
        organization_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<MatchingResult>>;

    /// Delete rows whose last refresh is older than `cutoff`.
    async fn prune_stale(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;

    async fn stats(&self, refreshed_since: DateTime<Utc>) -> StorageResult<ResultStats>;
}

#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn get_embedding(
        &self,
        source_type: EmbeddingSourceType,
        source_id: Uuid,
    ) -> StorageResult<Option<EmbeddingVector>>;

    async fn embeddings_of_type(
        &self,
        source_type: EmbeddingSourceType,
        limit: usize,
    ) -> StorageResult<Vec<EmbeddingVector>>;

    async fn upsert_embedding(&self, embedding: &EmbeddingVector) -> StorageResult<()>;

    /// Sources whose embedding is missing or older than the source row.
    async fn stale_embedding_sources(
        &self,
        source_type: EmbeddingSourceType,
        limit: usize,
    ) -> StorageResult<Vec<Uuid>>;
}

#[async_trait]
pub trait NotificationDirectory: Send + Sync {
    async fn digest_recipients(&self) -> StorageResult<Vec<DigestRecipient>>;
}

/// Every store concern as a shared trait object.
#[derive(Clone)]
pub struct StoreSet {
    pub preferences: Arc<dyn PreferenceStore>,
    pub directory: Arc<dyn OrganizationDirectory>,
    pub catalog: Arc<dyn OpportunityCatalog>,
    pub results: Arc<dyn ResultStore>,
    pub embeddings: Arc<dyn EmbeddingStore>,
    pub notifications: Arc<dyn NotificationDirectory>,
}

impl StoreSet {
    /// One backing store serving every concern.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: PreferenceStore
            + OrganizationDirectory
            + OpportunityCatalog
            + ResultStore
            + EmbeddingStore
            + NotificationDirectory
            + 'static,
    {
        Self {
            preferences: store.clone(),
            directory: store.clone(),
            catalog: store.clone(),
            results: store.clone(),
            embeddings: store.clone(),
            notifications: store,
        }
    }
}
