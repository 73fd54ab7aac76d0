//! Per-organization scoring and persistence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use gmr_core::{MatchingPreference, OpportunityRecord, ScoreOutcome, ScoringMode, SkipReason};
use gmr_scoring::{ScoringEngine, ScoringInput, SimilarityError, SimilarityProvider};
use gmr_storage::{ResultWrite, StorageError, StoreSet};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const DEFAULT_CANDIDATE_LIMIT: usize = 50;
pub const DEFAULT_MIN_STORE_SCORE: u8 = 30;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("organization {0} not found")]
    OrganizationNotFound(Uuid),
    #[error("no matching preference for organization {0}")]
    MissingPreference(Uuid),
    #[error("organization {0} has no members")]
    NoMembers(Uuid),
    #[error("similarity lookup failed: {0}")]
    Similarity(#[from] SimilarityError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub candidate_limit: usize,
    pub min_store_score: u8,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            min_store_score: DEFAULT_MIN_STORE_SCORE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    pub excluded_keyword: usize,
    pub region_mismatch: usize,
    pub expired: usize,
    pub below_threshold: usize,
}

impl SkipCounts {
    fn record(&mut self, reason: &SkipReason) {
        match reason {
            SkipReason::ExcludedKeyword { .. } => self.excluded_keyword += 1,
            SkipReason::RegionMismatch { .. } => self.region_mismatch += 1,
            SkipReason::Expired { .. } => self.expired += 1,
            SkipReason::BelowThreshold { .. } => self.below_threshold += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.excluded_keyword + self.region_mismatch + self.expired + self.below_threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationOutcome {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub mode: ScoringMode,
    pub candidates: usize,
    pub stored: usize,
    pub skipped: SkipCounts,
}

/// Scores one organization against its candidate opportunities and writes
/// every surviving pair through the result store.
#[derive(Clone)]
pub struct MatchingPipeline {
    stores: StoreSet,
    similarity: Arc<dyn SimilarityProvider>,
    engine: Arc<ScoringEngine>,
    settings: PipelineSettings,
}

impl MatchingPipeline {
    pub fn new(
        stores: StoreSet,
        similarity: Arc<dyn SimilarityProvider>,
        engine: Arc<ScoringEngine>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            stores,
            similarity,
            engine,
            settings,
        }
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    /// Batch entry: the most recently updated preference drives scoring.
    pub async fn process_organization(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<OrganizationOutcome, PipelineError> {
        let span = info_span!("process_organization", %organization_id);
        async {
            let preference = self
                .stores
                .preferences
                .preferences_for_organization(organization_id)
                .await?
                .into_iter()
                .next()
                .ok_or(PipelineError::MissingPreference(organization_id))?;
            if self.stores.directory.member_count(organization_id).await? == 0 {
                return Err(PipelineError::NoMembers(organization_id));
            }
            let user_id = preference.user_id;
            self.score_and_store(organization_id, user_id, Some(&preference), now)
                .await
        }
        .instrument(span)
        .await
    }

    /// On-demand entry for one member; degraded scoring when they have no preference.
    pub async fn process_for_member(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<OrganizationOutcome, PipelineError> {
        let preference = self
            .stores
            .preferences
            .get_preference(user_id, organization_id)
            .await?;
        self.score_and_store(organization_id, user_id, preference.as_ref(), now)
            .instrument(info_span!("process_for_member", %organization_id, %user_id))
            .await
    }

    async fn score_and_store(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        preference: Option<&MatchingPreference>,
        now: DateTime<Utc>,
    ) -> Result<OrganizationOutcome, PipelineError> {
        let organization = self
            .stores
            .directory
            .organization_profile(organization_id)
            .await?
            .ok_or(PipelineError::OrganizationNotFound(organization_id))?;
        let today = now.date_naive();

        let similarities = if preference.is_some_and(MatchingPreference::is_configured) {
            self.similarity
                .similar_opportunities(
                    organization_id,
                    &organization.profile_text(),
                    self.settings.candidate_limit,
                )
                .await?
                .into_iter()
                .map(|hit| (hit.opportunity_id, hit.similarity))
                .collect::<HashMap<_, _>>()
        } else {
            HashMap::new()
        };

        let candidates = self.candidates(&similarities, today).await?;
        let mode = if similarities.is_empty() {
            ScoringMode::Degraded
        } else {
            ScoringMode::Full
        };

        let mut outcome = OrganizationOutcome {
            organization_id,
            user_id,
            mode,
            candidates: candidates.len(),
            stored: 0,
            skipped: SkipCounts::default(),
        };

        for opportunity in &candidates {
            let scored = self.engine.score(&ScoringInput {
                organization: &organization,
                opportunity,
                preference,
                similarity: similarities.get(&opportunity.id).copied(),
                today,
            });
            let score = match scored {
                ScoreOutcome::Scored(score) if score.total_score >= self.settings.min_store_score => {
                    score
                }
                ScoreOutcome::Scored(score) => {
                    outcome.skipped.record(&SkipReason::BelowThreshold {
                        total_score: score.total_score,
                    });
                    continue;
                }
                ScoreOutcome::Skipped(reason) => {
                    debug!(opportunity_id = %opportunity.id, %reason, "pair skipped");
                    outcome.skipped.record(&reason);
                    continue;
                }
            };

            self.stores
                .results
                .upsert_result(&ResultWrite {
                    organization_id,
                    opportunity_id: opportunity.id,
                    user_id,
                    score,
                    refreshed_at: now,
                })
                .await?;
            outcome.stored += 1;
        }

        debug!(
            candidates = outcome.candidates,
            stored = outcome.stored,
            skipped = outcome.skipped.total(),
            mode = outcome.mode.as_str(),
            "organization scored"
        );
        Ok(outcome)
    }

    async fn candidates(
        &self,
        similarities: &HashMap<Uuid, f64>,
        today: NaiveDate,
    ) -> Result<Vec<OpportunityRecord>, PipelineError> {
        if similarities.is_empty() {
            return Ok(self
                .stores
                .catalog
                .open_opportunities(today, self.settings.candidate_limit)
                .await?);
        }
        let ids = similarities.keys().copied().collect::<Vec<_>>();
        Ok(self.stores.catalog.opportunities_by_ids(&ids).await?)
    }
}
