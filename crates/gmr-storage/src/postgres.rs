//! PostgreSQL implementation of every store contract.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gmr_core::{
    ConfidenceTier, EmbeddingSourceType, EmbeddingVector, Feedback, MatchingPreference,
    MatchingResult, MemberRole, NotificationSettings, OpportunityRecord, OrganizationProfile,
    PreferenceInput, ScoringMode, SubScores,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    DigestRecipient, EmbeddingStore, NotificationDirectory, OpportunityCatalog,
    OrganizationDirectory, Page, PageRequest, PreferenceStore, ResultFilter, ResultStats,
    ResultStore, ResultWrite, StorageError, StorageResult,
};

const MAX_DOCUMENT_SUMMARIES: i64 = 20;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn corrupt(table: &'static str, message: impl Into<String>) -> StorageError {
    StorageError::CorruptRow {
        table,
        message: message.into(),
    }
}

fn score_column(row: &PgRow, column: &str) -> StorageResult<u8> {
    let value: i16 = row.try_get(column)?;
    u8::try_from(value)
        .ok()
        .filter(|v| *v <= 100)
        .ok_or_else(|| corrupt("matching_results", format!("{column}={value} out of range")))
}

fn count_column(row: &PgRow, column: &str) -> StorageResult<u64> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

fn preference_from_row(row: &PgRow) -> StorageResult<MatchingPreference> {
    Ok(MatchingPreference {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        organization_id: row.try_get("organization_id")?,
        categories: row.try_get("categories")?,
        min_amount: row.try_get("min_amount")?,
        max_amount: row.try_get("max_amount")?,
        regions: row.try_get("regions")?,
        sub_regions: row.try_get("sub_regions")?,
        excluded_keywords: row.try_get("excluded_keywords")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn opportunity_from_row(row: &PgRow) -> StorageResult<OpportunityRecord> {
    Ok(OpportunityRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        organizer: row.try_get("organizer")?,
        category: row.try_get("category")?,
        sub_category: row.try_get("sub_category")?,
        eligibility_text: row.try_get("eligibility_text")?,
        description: row.try_get("description")?,
        region: row.try_get("region")?,
        min_amount: row.try_get("min_amount")?,
        max_amount: row.try_get("max_amount")?,
        deadline: row.try_get::<Option<NaiveDate>, _>("deadline")?,
        is_permanent: row.try_get("is_permanent")?,
        posted_at: row.try_get("posted_at")?,
    })
}

fn result_from_row(row: &PgRow) -> StorageResult<MatchingResult> {
    let confidence: String = row.try_get("confidence")?;
    let scoring_mode: String = row.try_get("scoring_mode")?;
    let feedback_relevant: Option<bool> = row.try_get("feedback_relevant")?;
    let feedback_at: Option<DateTime<Utc>> = row.try_get("feedback_at")?;
    let feedback = match (feedback_relevant, feedback_at) {
        (Some(relevant), Some(submitted_at)) => Some(Feedback {
            relevant,
            note: row.try_get("feedback_note")?,
            submitted_at,
        }),
        _ => None,
    };

    Ok(MatchingResult {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        opportunity_id: row.try_get("opportunity_id")?,
        user_id: row.try_get("user_id")?,
        sub_scores: SubScores {
            similarity: score_column(row, "similarity_score")?,
            category: score_column(row, "category_score")?,
            eligibility: score_column(row, "eligibility_score")?,
            timeliness: score_column(row, "timeliness_score")?,
            amount: score_column(row, "amount_score")?,
        },
        total_score: score_column(row, "total_score")?,
        confidence: confidence
            .parse::<ConfidenceTier>()
            .map_err(|err| corrupt("matching_results", err.to_string()))?,
        scoring_mode: scoring_mode
            .parse::<ScoringMode>()
            .map_err(|err| corrupt("matching_results", err.to_string()))?,
        match_reasons: row.try_get("match_reasons")?,
        feedback,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn embedding_from_row(row: &PgRow) -> StorageResult<EmbeddingVector> {
    let source_type: String = row.try_get("source_type")?;
    Ok(EmbeddingVector {
        source_type: source_type
            .parse()
            .map_err(|err: gmr_core::ParseEnumError| corrupt("embeddings", err.to_string()))?,
        source_id: row.try_get("source_id")?,
        model: row.try_get("model")?,
        content_hash: row.try_get("content_hash")?,
        vector: row.try_get("vector")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const PREFERENCE_COLUMNS: &str = "id, user_id, organization_id, categories, min_amount, max_amount, \
     regions, sub_regions, excluded_keywords, created_at, updated_at";

const OPPORTUNITY_COLUMNS: &str = "id, title, organizer, category, sub_category, eligibility_text, \
     description, region, min_amount, max_amount, deadline, is_permanent, posted_at";

const RESULT_COLUMNS: &str = "id, organization_id, opportunity_id, user_id, similarity_score, \
     category_score, eligibility_score, timeliness_score, amount_score, total_score, confidence, \
     scoring_mode, match_reasons, feedback_relevant, feedback_note, feedback_at, created_at, updated_at";

#[async_trait]
impl PreferenceStore for PgStore {
    async fn get_preference(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> StorageResult<Option<MatchingPreference>> {
        let row = sqlx::query(&format!(
            "SELECT {PREFERENCE_COLUMNS} FROM matching_preferences WHERE user_id = $1 AND organization_id = $2"
        ))
        .bind(user_id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(preference_from_row).transpose()
    }

    async fn preferences_for_organization(
        &self,
        organization_id: Uuid,
    ) -> StorageResult<Vec<MatchingPreference>> {
        let rows = sqlx::query(&format!(
            "SELECT {PREFERENCE_COLUMNS} FROM matching_preferences \
              WHERE organization_id = $1 ORDER BY updated_at DESC, id"
        ))
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(preference_from_row).collect()
    }

    async fn upsert_preference(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        input: &PreferenceInput,
        now: DateTime<Utc>,
    ) -> StorageResult<MatchingPreference> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO matching_preferences
                (id, user_id, organization_id, categories, min_amount, max_amount,
                 regions, sub_regions, excluded_keywords, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            ON CONFLICT (user_id, organization_id) DO UPDATE
               SET categories = EXCLUDED.categories,
                   min_amount = EXCLUDED.min_amount,
                   max_amount = EXCLUDED.max_amount,
                   regions = EXCLUDED.regions,
                   sub_regions = EXCLUDED.sub_regions,
                   excluded_keywords = EXCLUDED.excluded_keywords,
                   updated_at = EXCLUDED.updated_at
            RETURNING {PREFERENCE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(organization_id)
        .bind(&input.categories)
        .bind(input.min_amount)
        .bind(input.max_amount)
        .bind(&input.regions)
        .bind(&input.sub_regions)
        .bind(&input.excluded_keywords)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        preference_from_row(&row)
    }

    async fn delete_preference(&self, user_id: Uuid, organization_id: Uuid) -> StorageResult<bool> {
        let done = sqlx::query(
            "DELETE FROM matching_preferences WHERE user_id = $1 AND organization_id = $2",
        )
        .bind(user_id)
        .bind(organization_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl OrganizationDirectory for PgStore {
    async fn eligible_organization_ids(&self) -> StorageResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT o.id
              FROM organizations o
             WHERE EXISTS (SELECT 1 FROM matching_preferences p WHERE p.organization_id = o.id)
               AND EXISTS (SELECT 1 FROM organization_members m WHERE m.organization_id = o.id)
             ORDER BY o.created_at, o.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("id").map_err(StorageError::from))
            .collect()
    }

    async fn organization_profile(
        &self,
        organization_id: Uuid,
    ) -> StorageResult<Option<OrganizationProfile>> {
        let Some(row) = sqlx::query(
            r#"
            SELECT id, name, category, keywords, description, region,
                   employee_count, annual_revenue, certifications
              FROM organizations
             WHERE id = $1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let summaries = sqlx::query(
            r#"
            SELECT summary
              FROM organization_documents
             WHERE organization_id = $1
               AND summary IS NOT NULL
             ORDER BY created_at DESC
             LIMIT $2
            "#,
        )
        .bind(organization_id)
        .bind(MAX_DOCUMENT_SUMMARIES)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| r.try_get::<String, _>("summary"))
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(OrganizationProfile {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            category: row.try_get("category")?,
            keywords: row.try_get("keywords")?,
            description: row.try_get("description")?,
            region: row.try_get("region")?,
            employee_count: row.try_get("employee_count")?,
            annual_revenue: row.try_get("annual_revenue")?,
            certifications: row.try_get("certifications")?,
            document_summaries: summaries,
        }))
    }

    async fn member_count(&self, organization_id: Uuid) -> StorageResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS members FROM organization_members WHERE organization_id = $1",
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await?;
        count_column(&row, "members")
    }

    async fn member_role(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> StorageResult<Option<MemberRole>> {
        let row = sqlx::query(
            "SELECT role FROM organization_members WHERE organization_id = $1 AND user_id = $2",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let role: String = row.try_get("role")?;
                role.parse()
                    .map(Some)
                    .map_err(|err: gmr_core::ParseEnumError| corrupt("organization_members", err.to_string()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OpportunityCatalog for PgStore {
    async fn opportunities_by_ids(&self, ids: &[Uuid]) -> StorageResult<Vec<OpportunityRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE id = ANY($1) AND is_active"
        ))
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn open_opportunities(
        &self,
        today: NaiveDate,
        limit: usize,
    ) -> StorageResult<Vec<OpportunityRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OPPORTUNITY_COLUMNS}
              FROM opportunities
             WHERE is_active
               AND (is_permanent OR deadline IS NULL OR deadline >= $1)
             ORDER BY posted_at DESC NULLS LAST, id
             LIMIT $2
            "#
        ))
        .bind(today)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(opportunity_from_row).collect()
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn upsert_result(&self, write: &ResultWrite) -> StorageResult<Uuid> {
        let score = &write.score;
        let row = sqlx::query(
            r#"
            INSERT INTO matching_results
                (id, organization_id, opportunity_id, user_id,
                 similarity_score, category_score, eligibility_score, timeliness_score, amount_score,
                 total_score, confidence, scoring_mode, match_reasons, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            ON CONFLICT (organization_id, opportunity_id) DO UPDATE
               SET user_id = EXCLUDED.user_id,
                   similarity_score = EXCLUDED.similarity_score,
                   category_score = EXCLUDED.category_score,
                   eligibility_score = EXCLUDED.eligibility_score,
                   timeliness_score = EXCLUDED.timeliness_score,
                   amount_score = EXCLUDED.amount_score,
                   total_score = EXCLUDED.total_score,
                   confidence = EXCLUDED.confidence,
                   scoring_mode = EXCLUDED.scoring_mode,
                   match_reasons = EXCLUDED.match_reasons,
                   updated_at = EXCLUDED.updated_at
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(write.organization_id)
        .bind(write.opportunity_id)
        .bind(write.user_id)
        .bind(i16::from(score.sub_scores.similarity))
        .bind(i16::from(score.sub_scores.category))
        .bind(i16::from(score.sub_scores.eligibility))
        .bind(i16::from(score.sub_scores.timeliness))
        .bind(i16::from(score.sub_scores.amount))
        .bind(i16::from(score.total_score))
        .bind(score.confidence.as_str())
        .bind(score.mode.as_str())
        .bind(score.reason_texts())
        .bind(write.refreshed_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn get_result(&self, result_id: Uuid) -> StorageResult<Option<MatchingResult>> {
        let row = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM matching_results WHERE id = $1"
        ))
        .bind(result_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(result_from_row).transpose()
    }

    async fn list_results(
        &self,
        organization_id: Uuid,
        filter: ResultFilter,
        page: PageRequest,
    ) -> StorageResult<Page<MatchingResult>> {
        let tiers = filter
            .allowed_tiers()
            .iter()
            .map(|t| t.as_str().to_string())
            .collect::<Vec<_>>();

        let total_row = sqlx::query(
            "SELECT COUNT(*) AS total FROM matching_results WHERE organization_id = $1 AND confidence = ANY($2)",
        )
        .bind(organization_id)
        .bind(&tiers)
        .fetch_one(&self.pool)
        .await?;
        let total = count_column(&total_row, "total")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
              FROM matching_results
             WHERE organization_id = $1
               AND confidence = ANY($2)
             ORDER BY total_score DESC, updated_at DESC, id
             LIMIT $3 OFFSET $4
            "#
        ))
        .bind(organization_id)
        .bind(&tiers)
        .bind(i64::from(page.per_page()))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;
        let items = rows.iter().map(result_from_row).collect::<StorageResult<Vec<_>>>()?;
        Ok(Page::new(items, page, total))
    }

    async fn set_feedback(&self, result_id: Uuid, feedback: &Feedback) -> StorageResult<bool> {
        let done = sqlx::query(
            r#"
            UPDATE matching_results
               SET feedback_relevant = $2,
                   feedback_note = $3,
                   feedback_at = $4
             WHERE id = $1
            "#,
        )
        .bind(result_id)
        .bind(feedback.relevant)
        .bind(feedback.note.as_deref())
        .bind(feedback.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn results_created_between(
        &self,
        organization_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<MatchingResult>> {
        if organization_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RESULT_COLUMNS}
              FROM matching_results
             WHERE organization_id = ANY($1)
               AND created_at >= $2
               AND created_at < $3
             ORDER BY total_score DESC, id
            "#
        ))
        .bind(organization_ids.to_vec())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn prune_stale(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let done = sqlx::query("DELETE FROM matching_results WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn stats(&self, refreshed_since: DateTime<Utc>) -> StorageResult<ResultStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_results,
                   COUNT(*) FILTER (WHERE updated_at >= $1) AS refreshed_since,
                   COUNT(DISTINCT organization_id) AS organizations_with_results,
                   COUNT(*) FILTER (WHERE confidence = 'high') AS high,
                   COUNT(*) FILTER (WHERE confidence = 'medium') AS medium,
                   COUNT(*) FILTER (WHERE confidence = 'low') AS low,
                   COUNT(*) FILTER (WHERE scoring_mode = 'degraded') AS degraded
              FROM matching_results
            "#,
        )
        .bind(refreshed_since)
        .fetch_one(&self.pool)
        .await?;
        Ok(ResultStats {
            total_results: count_column(&row, "total_results")?,
            refreshed_since: count_column(&row, "refreshed_since")?,
            organizations_with_results: count_column(&row, "organizations_with_results")?,
            high: count_column(&row, "high")?,
            medium: count_column(&row, "medium")?,
            low: count_column(&row, "low")?,
            degraded: count_column(&row, "degraded")?,
        })
    }
}

#[async_trait]
impl EmbeddingStore for PgStore {
    async fn get_embedding(
        &self,
        source_type: EmbeddingSourceType,
        source_id: Uuid,
    ) -> StorageResult<Option<EmbeddingVector>> {
        let row = sqlx::query(
            r#"
            SELECT source_type, source_id, model, content_hash, vector, updated_at
              FROM embeddings
             WHERE source_type = $1 AND source_id = $2
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(embedding_from_row).transpose()
    }

    async fn embeddings_of_type(
        &self,
        source_type: EmbeddingSourceType,
        limit: usize,
    ) -> StorageResult<Vec<EmbeddingVector>> {
        let rows = sqlx::query(
            r#"
            SELECT source_type, source_id, model, content_hash, vector, updated_at
              FROM embeddings
             WHERE source_type = $1
             ORDER BY updated_at DESC
             LIMIT $2
            "#,
        )
        .bind(source_type.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(embedding_from_row).collect()
    }

    async fn upsert_embedding(&self, embedding: &EmbeddingVector) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (source_type, source_id, model, content_hash, vector, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_type, source_id) DO UPDATE
               SET model = EXCLUDED.model,
                   content_hash = EXCLUDED.content_hash,
                   vector = EXCLUDED.vector,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(embedding.source_type.as_str())
        .bind(embedding.source_id)
        .bind(&embedding.model)
        .bind(&embedding.content_hash)
        .bind(&embedding.vector)
        .bind(embedding.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stale_embedding_sources(
        &self,
        source_type: EmbeddingSourceType,
        limit: usize,
    ) -> StorageResult<Vec<Uuid>> {
        let sql = match source_type {
            EmbeddingSourceType::Organization => {
                r#"
                SELECT o.id
                  FROM organizations o
                  LEFT JOIN embeddings e
                    ON e.source_type = 'organization' AND e.source_id = o.id
                 WHERE e.source_id IS NULL OR e.updated_at < o.updated_at
                 ORDER BY o.updated_at DESC
                 LIMIT $1
                "#
            }
            EmbeddingSourceType::Opportunity => {
                r#"
                SELECT o.id
                  FROM opportunities o
                  LEFT JOIN embeddings e
                    ON e.source_type = 'opportunity' AND e.source_id = o.id
                 WHERE o.is_active
                   AND (e.source_id IS NULL OR e.updated_at < o.updated_at)
                 ORDER BY o.updated_at DESC
                 LIMIT $1
                "#
            }
        };
        let rows = sqlx::query(sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("id").map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl NotificationDirectory for PgStore {
    async fn digest_recipients(&self) -> StorageResult<Vec<DigestRecipient>> {
        let rows = sqlx::query(
            r#"
            SELECT ns.user_id, ns.notify_results, ns.email, ns.email_enabled,
                   ns.slack_webhook_url, ns.discord_webhook_url,
                   ARRAY(
                       SELECT m.organization_id
                         FROM organization_members m
                        WHERE m.user_id = ns.user_id
                        ORDER BY m.organization_id
                   ) AS organization_ids
              FROM notification_settings ns
             WHERE ns.notify_results
             ORDER BY ns.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DigestRecipient {
                settings: NotificationSettings {
                    user_id: row.try_get("user_id")?,
                    notify_results: row.try_get("notify_results")?,
                    email: row.try_get("email")?,
                    email_enabled: row.try_get("email_enabled")?,
                    slack_webhook_url: row.try_get("slack_webhook_url")?,
                    discord_webhook_url: row.try_get("discord_webhook_url")?,
                },
                organization_ids: row.try_get("organization_ids")?,
            });
        }
        Ok(out)
    }
}
