//! Staleness cleanup for result rows. Runs on its own trigger, outside scoring.

use chrono::{DateTime, Duration, Utc};
use gmr_storage::{ResultStore, StorageResult};
use serde::Serialize;
use tracing::info;

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PruneSummary {
    pub cutoff: DateTime<Utc>,
    pub removed: u64,
}

pub async fn prune_stale_results(
    results: &dyn ResultStore,
    retention_days: i64,
    now: DateTime<Utc>,
) -> StorageResult<PruneSummary> {
    let cutoff = now - Duration::days(retention_days.max(1));
    let removed = results.prune_stale(cutoff).await?;
    info!(%cutoff, removed, "pruned stale matching results");
    Ok(PruneSummary { cutoff, removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gmr_core::{ConfidenceTier, ScoreResult, ScoringMode, SubScores};
    use gmr_storage::{MemoryStore, ResultWrite};
    use uuid::Uuid;

    #[tokio::test]
    async fn only_rows_outside_retention_are_removed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let org = Uuid::new_v4();
        let (fresh, stale) = (Uuid::new_v4(), Uuid::new_v4());
        for opp in [fresh, stale] {
            store
                .upsert_result(&ResultWrite {
                    organization_id: org,
                    opportunity_id: opp,
                    user_id: Uuid::new_v4(),
                    score: ScoreResult {
                        sub_scores: SubScores::default(),
                        total_score: 75,
                        confidence: ConfidenceTier::Medium,
                        mode: ScoringMode::Full,
                        reasons: vec![],
                    },
                    refreshed_at: now,
                })
                .await
                .unwrap();
        }
        let old = now - Duration::days(DEFAULT_RETENTION_DAYS + 1);
        assert!(store.backdate_result(org, stale, old, old).await);

        let summary = prune_stale_results(&store, DEFAULT_RETENTION_DAYS, now)
            .await
            .unwrap();
        assert_eq!(summary.removed, 1);
        assert!(store.result_for_pair(org, fresh).await.is_some());
        assert!(store.result_for_pair(org, stale).await.is_none());
    }
}
