//! In-process store for tests and local dry runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gmr_core::{
    EmbeddingSourceType, EmbeddingVector, Feedback, MatchingPreference, MatchingResult, MemberRole,
    NotificationSettings, OpportunityRecord, OrganizationProfile, PreferenceInput, ScoringMode,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    DigestRecipient, EmbeddingStore, NotificationDirectory, OpportunityCatalog,
    OrganizationDirectory, Page, PageRequest, PreferenceStore, ResultFilter, ResultStats,
    ResultStore, ResultWrite, StorageResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    organizations: BTreeMap<Uuid, OrganizationProfile>,
    members: BTreeMap<(Uuid, Uuid), MemberRole>,
    opportunities: BTreeMap<Uuid, OpportunityRecord>,
    inactive_opportunities: BTreeSet<Uuid>,
    preferences: BTreeMap<(Uuid, Uuid), MatchingPreference>,
    results: BTreeMap<(Uuid, Uuid), MatchingResult>,
    embeddings: BTreeMap<(EmbeddingSourceType, Uuid), EmbeddingVector>,
    source_updated_at: BTreeMap<(EmbeddingSourceType, Uuid), DateTime<Utc>>,
    notification_settings: BTreeMap<Uuid, NotificationSettings>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_organization(&self, profile: OrganizationProfile) {
        let mut state = self.state.write().await;
        state
            .source_updated_at
            .insert((EmbeddingSourceType::Organization, profile.id), Utc::now());
        state.organizations.insert(profile.id, profile);
    }

    pub async fn add_member(&self, organization_id: Uuid, user_id: Uuid, role: MemberRole) {
        self.state
            .write()
            .await
            .members
            .insert((organization_id, user_id), role);
    }

    pub async fn insert_opportunity(&self, opportunity: OpportunityRecord) {
        let mut state = self.state.write().await;
        state
            .source_updated_at
            .insert((EmbeddingSourceType::Opportunity, opportunity.id), Utc::now());
        state.inactive_opportunities.remove(&opportunity.id);
        state.opportunities.insert(opportunity.id, opportunity);
    }

    pub async fn deactivate_opportunity(&self, opportunity_id: Uuid) {
        self.state
            .write()
            .await
            .inactive_opportunities
            .insert(opportunity_id);
    }

    pub async fn insert_preference(&self, preference: MatchingPreference) {
        self.state
            .write()
            .await
            .preferences
            .insert((preference.user_id, preference.organization_id), preference);
    }

    pub async fn set_notification_settings(&self, settings: NotificationSettings) {
        self.state
            .write()
            .await
            .notification_settings
            .insert(settings.user_id, settings);
    }

    /// Overwrite a stored row's timestamps; used to age rows in maintenance tests.
    pub async fn backdate_result(
        &self,
        organization_id: Uuid,
        opportunity_id: Uuid,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.write().await;
        match state.results.get_mut(&(organization_id, opportunity_id)) {
            Some(row) => {
                row.created_at = created_at;
                row.updated_at = updated_at;
                true
            }
            None => false,
        }
    }

    pub async fn result_for_pair(
        &self,
        organization_id: Uuid,
        opportunity_id: Uuid,
    ) -> Option<MatchingResult> {
        self.state
            .read()
            .await
            .results
            .get(&(organization_id, opportunity_id))
            .cloned()
    }

    pub async fn result_count(&self) -> usize {
        self.state.read().await.results.len()
    }

    pub async fn all_results(&self) -> Vec<MatchingResult> {
        self.state.read().await.results.values().cloned().collect()
    }
}

#[async_trait]
impl PreferenceStore for MemoryStore {
    async fn get_preference(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> StorageResult<Option<MatchingPreference>> {
        Ok(self
            .state
            .read()
            .await
            .preferences
            .get(&(user_id, organization_id))
            .cloned())
    }

    async fn preferences_for_organization(
        &self,
        organization_id: Uuid,
    ) -> StorageResult<Vec<MatchingPreference>> {
        let state = self.state.read().await;
        let mut prefs = state
            .preferences
            .values()
            .filter(|p| p.organization_id == organization_id)
            .cloned()
            .collect::<Vec<_>>();
        prefs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(prefs)
    }

    async fn upsert_preference(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        input: &PreferenceInput,
        now: DateTime<Utc>,
    ) -> StorageResult<MatchingPreference> {
        let mut state = self.state.write().await;
        let entry = state
            .preferences
            .entry((user_id, organization_id))
            .or_insert_with(|| MatchingPreference {
                id: Uuid::new_v4(),
                user_id,
                organization_id,
                categories: Vec::new(),
                min_amount: None,
                max_amount: None,
                regions: Vec::new(),
                sub_regions: Vec::new(),
                excluded_keywords: Vec::new(),
                created_at: now,
                updated_at: now,
            });
        entry.categories = input.categories.clone();
        entry.min_amount = input.min_amount;
        entry.max_amount = input.max_amount;
        entry.regions = input.regions.clone();
        entry.sub_regions = input.sub_regions.clone();
        entry.excluded_keywords = input.excluded_keywords.clone();
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn delete_preference(&self, user_id: Uuid, organization_id: Uuid) -> StorageResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .preferences
            .remove(&(user_id, organization_id))
            .is_some())
    }
}

#[async_trait]
impl OrganizationDirectory for MemoryStore {
    async fn eligible_organization_ids(&self) -> StorageResult<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .organizations
            .keys()
            .copied()
            .filter(|org| state.preferences.values().any(|p| p.organization_id == *org))
            .filter(|org| state.members.keys().any(|(member_org, _)| member_org == org))
            .collect())
    }

    async fn organization_profile(
        &self,
        organization_id: Uuid,
    ) -> StorageResult<Option<OrganizationProfile>> {
        Ok(self
            .state
            .read()
            .await
            .organizations
            .get(&organization_id)
            .cloned())
    }

    async fn member_count(&self, organization_id: Uuid) -> StorageResult<u64> {
        Ok(self
            .state
            .read()
            .await
            .members
            .keys()
            .filter(|(org, _)| *org == organization_id)
            .count() as u64)
    }

    async fn member_role(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> StorageResult<Option<MemberRole>> {
        Ok(self
            .state
            .read()
            .await
            .members
            .get(&(organization_id, user_id))
            .copied())
    }
}

#[async_trait]
impl OpportunityCatalog for MemoryStore {
    async fn opportunities_by_ids(&self, ids: &[Uuid]) -> StorageResult<Vec<OpportunityRecord>> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter(|id| !state.inactive_opportunities.contains(id))
            .filter_map(|id| state.opportunities.get(id).cloned())
            .collect())
    }

    async fn open_opportunities(
        &self,
        today: NaiveDate,
        limit: usize,
    ) -> StorageResult<Vec<OpportunityRecord>> {
        let state = self.state.read().await;
        let mut open = state
            .opportunities
            .values()
            .filter(|o| !state.inactive_opportunities.contains(&o.id))
            .filter(|o| !o.is_expired(today))
            .cloned()
            .collect::<Vec<_>>();
        open.sort_by(|a, b| b.posted_at.cmp(&a.posted_at).then(a.id.cmp(&b.id)));
        open.truncate(limit);
        Ok(open)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn upsert_result(&self, write: &ResultWrite) -> StorageResult<Uuid> {
        let mut state = self.state.write().await;
        let key = (write.organization_id, write.opportunity_id);
        let score = &write.score;
        let (id, created_at, feedback) = match state.results.get(&key) {
            Some(existing) => (existing.id, existing.created_at, existing.feedback.clone()),
            None => (Uuid::new_v4(), write.refreshed_at, None),
        };
        state.results.insert(
            key,
            MatchingResult {
                id,
                organization_id: write.organization_id,
                opportunity_id: write.opportunity_id,
                user_id: write.user_id,
                sub_scores: score.sub_scores,
                total_score: score.total_score,
                confidence: score.confidence,
                scoring_mode: score.mode,
                match_reasons: score.reason_texts(),
                feedback,
                created_at,
                updated_at: write.refreshed_at,
            },
        );
        Ok(id)
    }

    async fn get_result(&self, result_id: Uuid) -> StorageResult<Option<MatchingResult>> {
        Ok(self
            .state
            .read()
            .await
            .results
            .values()
            .find(|r| r.id == result_id)
            .cloned())
    }

    async fn list_results(
        &self,
        organization_id: Uuid,
        filter: ResultFilter,
        page: PageRequest,
    ) -> StorageResult<Page<MatchingResult>> {
        let tiers = filter.allowed_tiers();
        let state = self.state.read().await;
        let mut rows = state
            .results
            .values()
            .filter(|r| r.organization_id == organization_id && tiers.contains(&r.confidence))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.total_score
                .cmp(&a.total_score)
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.id.cmp(&b.id))
        });
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page() as usize)
            .collect();
        Ok(Page::new(items, page, total))
    }

    async fn set_feedback(&self, result_id: Uuid, feedback: &Feedback) -> StorageResult<bool> {
        let mut state = self.state.write().await;
        match state.results.values_mut().find(|r| r.id == result_id) {
            Some(row) => {
                row.feedback = Some(feedback.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn results_created_between(
        &self,
        organization_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<MatchingResult>> {
        let state = self.state.read().await;
        let mut rows = state
            .results
            .values()
            .filter(|r| organization_ids.contains(&r.organization_id))
            .filter(|r| r.created_at >= from && r.created_at < to)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.total_score.cmp(&a.total_score).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn prune_stale(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let mut state = self.state.write().await;
        let before = state.results.len();
        state.results.retain(|_, r| r.updated_at >= cutoff);
        Ok((before - state.results.len()) as u64)
    }

    async fn stats(&self, refreshed_since: DateTime<Utc>) -> StorageResult<ResultStats> {
        use gmr_core::ConfidenceTier;

        let state = self.state.read().await;
        let mut stats = ResultStats::default();
        let mut orgs = BTreeSet::new();
        for row in state.results.values() {
            stats.total_results += 1;
            if row.updated_at >= refreshed_since {
                stats.refreshed_since += 1;
            }
            orgs.insert(row.organization_id);
            match row.confidence {
                ConfidenceTier::High => stats.high += 1,
                ConfidenceTier::Medium => stats.medium += 1,
                ConfidenceTier::Low => stats.low += 1,
            }
            if row.scoring_mode == ScoringMode::Degraded {
                stats.degraded += 1;
            }
        }
        stats.organizations_with_results = orgs.len() as u64;
        Ok(stats)
    }
}

#[async_trait]
impl EmbeddingStore for MemoryStore {
    async fn get_embedding(
        &self,
        source_type: EmbeddingSourceType,
        source_id: Uuid,
    ) -> StorageResult<Option<EmbeddingVector>> {
        Ok(self
            .state
            .read()
            .await
            .embeddings
            .get(&(source_type, source_id))
            .cloned())
    }

    async fn embeddings_of_type(
        &self,
        source_type: EmbeddingSourceType,
        limit: usize,
    ) -> StorageResult<Vec<EmbeddingVector>> {
        Ok(self
            .state
            .read()
            .await
            .embeddings
            .values()
            .filter(|e| e.source_type == source_type)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_embedding(&self, embedding: &EmbeddingVector) -> StorageResult<()> {
        self.state
            .write()
            .await
            .embeddings
            .insert((embedding.source_type, embedding.source_id), embedding.clone());
        Ok(())
    }

    async fn stale_embedding_sources(
        &self,
        source_type: EmbeddingSourceType,
        limit: usize,
    ) -> StorageResult<Vec<Uuid>> {
        let state = self.state.read().await;
        let mut stale = Vec::new();
        for ((kind, id), updated_at) in &state.source_updated_at {
            if *kind != source_type {
                continue;
            }
            if source_type == EmbeddingSourceType::Opportunity
                && state.inactive_opportunities.contains(id)
            {
                continue;
            }
            let fresh = state
                .embeddings
                .get(&(*kind, *id))
                .is_some_and(|e| e.updated_at >= *updated_at);
            if !fresh {
                stale.push(*id);
            }
            if stale.len() >= limit {
                break;
            }
        }
        Ok(stale)
    }
}

#[async_trait]
impl NotificationDirectory for MemoryStore {
    async fn digest_recipients(&self) -> StorageResult<Vec<DigestRecipient>> {
        let state = self.state.read().await;
        Ok(state
            .notification_settings
            .values()
            .filter(|s| s.notify_results)
            .map(|settings| DigestRecipient {
                settings: settings.clone(),
                organization_ids: state
                    .members
                    .keys()
                    .filter(|(_, user)| *user == settings.user_id)
                    .map(|(org, _)| *org)
                    .collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gmr_core::{ConfidenceTier, ScoreResult, SubScores};

    fn score(total: u8) -> ScoreResult {
        ScoreResult {
            sub_scores: SubScores {
                similarity: total,
                category: total,
                eligibility: total,
                timeliness: total,
                amount: total,
            },
            total_score: total,
            confidence: ConfidenceTier::from_total(total),
            mode: ScoringMode::Full,
            reasons: vec![],
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_keeps_feedback() {
        let store = MemoryStore::new();
        let (org, opp, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let t0 = Utc::now();
        let write = ResultWrite {
            organization_id: org,
            opportunity_id: opp,
            user_id: user,
            score: score(80),
            refreshed_at: t0,
        };

        let first = store.upsert_result(&write).await.unwrap();
        store
            .set_feedback(
                first,
                &Feedback {
                    relevant: false,
                    note: Some("not our field".into()),
                    submitted_at: t0,
                },
            )
            .await
            .unwrap();

        let rerun = ResultWrite {
            score: score(90),
            refreshed_at: t0 + Duration::hours(24),
            ..write
        };
        let second = store.upsert_result(&rerun).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.result_count().await, 1);
        let row = store.result_for_pair(org, opp).await.unwrap();
        assert_eq!(row.total_score, 90);
        assert_eq!(row.created_at, t0);
        assert_eq!(row.feedback.map(|f| f.relevant), Some(false));
    }

    #[tokio::test]
    async fn prune_removes_only_rows_older_than_cutoff() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let org = Uuid::new_v4();
        for age_days in [1, 29, 31, 45] {
            store
                .upsert_result(&ResultWrite {
                    organization_id: org,
                    opportunity_id: Uuid::new_v4(),
                    user_id: Uuid::new_v4(),
                    score: score(75),
                    refreshed_at: now - Duration::days(age_days),
                })
                .await
                .unwrap();
        }
        let removed = store.prune_stale(now - Duration::days(30)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.result_count().await, 2);
    }

    #[tokio::test]
    async fn eligibility_requires_preference_and_member() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let with_both = Uuid::new_v4();
        let no_member = Uuid::new_v4();
        for id in [with_both, no_member] {
            store
                .insert_organization(OrganizationProfile {
                    id,
                    name: "org".into(),
                    ..Default::default()
                })
                .await;
            store
                .upsert_preference(
                    Uuid::new_v4(),
                    id,
                    &PreferenceInput {
                        categories: vec!["기술".into()],
                        ..Default::default()
                    },
                    now,
                )
                .await
                .unwrap();
        }
        store.add_member(with_both, Uuid::new_v4(), MemberRole::Owner).await;

        assert_eq!(store.eligible_organization_ids().await.unwrap(), vec![with_both]);
    }

    #[tokio::test]
    async fn listing_filters_by_confidence_and_paginates() {
        let store = MemoryStore::new();
        let org = Uuid::new_v4();
        let now = Utc::now();
        for total in [95, 88, 72, 40, 30] {
            store
                .upsert_result(&ResultWrite {
                    organization_id: org,
                    opportunity_id: Uuid::new_v4(),
                    user_id: Uuid::new_v4(),
                    score: score(total),
                    refreshed_at: now,
                })
                .await
                .unwrap();
        }
        let page = store
            .list_results(
                org,
                ResultFilter {
                    min_confidence: Some(ConfidenceTier::Medium),
                },
                PageRequest::new(1, 2),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 2);
        assert_eq!(
            page.items.iter().map(|r| r.total_score).collect::<Vec<_>>(),
            vec![95, 88]
        );
    }
}
