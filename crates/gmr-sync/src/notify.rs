//! Daily digest fan-out over independently enabled channels.

use std::collections::HashMap;
use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use gmr_core::{ConfidenceTier, MatchingResult, NotificationSettings, OpportunityRecord};
use gmr_storage::{
    HttpError, JsonHttpClient, NotificationDirectory, OpportunityCatalog, ResultStore, StorageError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_DIGEST_TOP_N: usize = 5;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("channel request failed: {0}")]
    Http(#[from] HttpError),
    #[error("rendering digest: {0}")]
    Render(#[from] askama::Error),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("{channel} enabled without a destination")]
    MissingDestination { channel: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestEntry {
    pub result_id: Uuid,
    pub organization_id: Uuid,
    pub opportunity_id: Uuid,
    pub title: String,
    pub organizer: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub is_permanent: bool,
    pub total_score: u8,
    pub confidence: ConfidenceTier,
    pub reasons: Vec<String>,
}

impl DigestEntry {
    fn deadline_label(&self) -> String {
        match (self.is_permanent, self.deadline) {
            (true, _) => "상시".to_string(),
            (false, Some(deadline)) => deadline.to_string(),
            (false, None) => "-".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserDigest {
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub entries: Vec<DigestEntry>,
}

impl UserDigest {
    pub fn subject(&self) -> String {
        format!("[지원사업 추천] {} 새 매칭 결과 {}건", self.date, self.entries.len())
    }

    /// Chat-channel rendering.
    pub fn plain_text(&self) -> String {
        let mut lines = vec![self.subject()];
        for (rank, entry) in self.entries.iter().enumerate() {
            lines.push(format!(
                "{}. {} ({}점, {}, 마감 {})",
                rank + 1,
                entry.title,
                entry.total_score,
                entry.confidence,
                entry.deadline_label()
            ));
        }
        lines.join("\n")
    }
}

struct DigestLine {
    title: String,
    organizer: String,
    reasons: String,
    score: u8,
    confidence: &'static str,
    deadline: String,
}

#[derive(Template)]
#[template(path = "digest_email.html")]
struct DigestEmailTemplate {
    subject: String,
    heading: String,
    date: String,
    lines: Vec<DigestLine>,
}

pub fn render_email(digest: &UserDigest) -> Result<String, NotifyError> {
    let template = DigestEmailTemplate {
        subject: digest.subject(),
        heading: "오늘의 맞춤 지원사업".to_string(),
        date: digest.date.to_string(),
        lines: digest
            .entries
            .iter()
            .map(|entry| DigestLine {
                title: entry.title.clone(),
                organizer: entry.organizer.clone().unwrap_or_default(),
                reasons: entry.reasons.join(" · "),
                score: entry.total_score,
                confidence: entry.confidence.as_str(),
                deadline: entry.deadline_label(),
            })
            .collect(),
    };
    Ok(template.render()?)
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    fn enabled_for(&self, settings: &NotificationSettings) -> bool;

    async fn deliver(
        &self,
        settings: &NotificationSettings,
        digest: &UserDigest,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    html: String,
}

/// Transactional email over a JSON send API.
#[derive(Debug, Clone)]
pub struct EmailChannel {
    client: JsonHttpClient,
    config: EmailConfig,
}

impl EmailChannel {
    pub fn new(client: JsonHttpClient, config: EmailConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn enabled_for(&self, settings: &NotificationSettings) -> bool {
        settings.email_enabled
    }

    async fn deliver(
        &self,
        settings: &NotificationSettings,
        digest: &UserDigest,
    ) -> Result<(), NotifyError> {
        let to = settings
            .email
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or(NotifyError::MissingDestination { channel: "email" })?;
        let payload = EmailPayload {
            from: &self.config.from,
            to: [to],
            subject: digest.subject(),
            html: render_email(digest)?,
        };
        self.client
            .post_json_discard(&self.config.api_url, Some(self.config.api_key.as_str()), &payload)
            .await?;
        Ok(())
    }
}

/// Blank webhook URLs count as not configured.
fn webhook_url(url: &Option<String>) -> Option<&str> {
    url.as_deref().map(str::trim).filter(|u| !u.is_empty())
}

#[derive(Debug, Clone)]
pub struct SlackChannel {
    client: JsonHttpClient,
}

impl SlackChannel {
    pub fn new(client: JsonHttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled_for(&self, settings: &NotificationSettings) -> bool {
        webhook_url(&settings.slack_webhook_url).is_some()
    }

    async fn deliver(
        &self,
        settings: &NotificationSettings,
        digest: &UserDigest,
    ) -> Result<(), NotifyError> {
        let url = webhook_url(&settings.slack_webhook_url)
            .ok_or(NotifyError::MissingDestination { channel: "slack" })?;
        self.client
            .post_json_discard(url, None, &serde_json::json!({ "text": digest.plain_text() }))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DiscordChannel {
    client: JsonHttpClient,
}

impl DiscordChannel {
    pub fn new(client: JsonHttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn enabled_for(&self, settings: &NotificationSettings) -> bool {
        webhook_url(&settings.discord_webhook_url).is_some()
    }

    async fn deliver(
        &self,
        settings: &NotificationSettings,
        digest: &UserDigest,
    ) -> Result<(), NotifyError> {
        let url = webhook_url(&settings.discord_webhook_url)
            .ok_or(NotifyError::MissingDestination { channel: "discord" })?;
        self.client
            .post_json_discard(url, None, &serde_json::json!({ "content": digest.plain_text() }))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifySummary {
    pub recipients: usize,
    pub digests: usize,
    pub deliveries: usize,
    pub failures: usize,
    pub errors: Vec<String>,
}

pub struct DigestDispatcher {
    directory: Arc<dyn NotificationDirectory>,
    results: Arc<dyn ResultStore>,
    catalog: Arc<dyn OpportunityCatalog>,
    channels: Vec<Box<dyn NotificationChannel>>,
    top_n: usize,
}

impl DigestDispatcher {
    pub fn new(
        directory: Arc<dyn NotificationDirectory>,
        results: Arc<dyn ResultStore>,
        catalog: Arc<dyn OpportunityCatalog>,
        channels: Vec<Box<dyn NotificationChannel>>,
        top_n: usize,
    ) -> Self {
        Self {
            directory,
            results,
            catalog,
            channels,
            top_n,
        }
    }

    /// Send each opted-in user a digest of results created during `now`'s UTC day.
    pub async fn dispatch(&self, now: DateTime<Utc>) -> NotifySummary {
        self.dispatch_inner(now)
            .instrument(info_span!("matching_notify", date = %now.date_naive()))
            .await
    }

    async fn dispatch_inner(&self, now: DateTime<Utc>) -> NotifySummary {
        let mut summary = NotifySummary::default();
        let recipients = match self.directory.digest_recipients().await {
            Ok(recipients) => recipients,
            Err(err) => {
                warn!(error = %err, "loading digest recipients failed");
                summary.errors.push(format!("recipients: {err}"));
                return summary;
            }
        };
        summary.recipients = recipients.len();

        let day = now.date_naive();
        let from = day.and_time(NaiveTime::MIN).and_utc();
        let to = from + Duration::days(1);

        for recipient in recipients.iter().filter(|r| r.settings.notify_results) {
            let user_id = recipient.settings.user_id;
            let digest = match self
                .build_digest(user_id, &recipient.organization_ids, day, from, to)
                .await
            {
                Ok(Some(digest)) => digest,
                Ok(None) => continue,
                Err(err) => {
                    warn!(%user_id, error = %err, "building digest failed");
                    summary.failures += 1;
                    summary.errors.push(format!("{user_id}: {err}"));
                    continue;
                }
            };
            summary.digests += 1;

            for channel in self
                .channels
                .iter()
                .filter(|c| c.enabled_for(&recipient.settings))
            {
                match channel.deliver(&recipient.settings, &digest).await {
                    Ok(()) => summary.deliveries += 1,
                    Err(err) => {
                        warn!(%user_id, channel = channel.name(), error = %err, "digest delivery failed");
                        summary.failures += 1;
                        summary
                            .errors
                            .push(format!("{user_id} via {}: {err}", channel.name()));
                    }
                }
            }
        }

        info!(
            recipients = summary.recipients,
            digests = summary.digests,
            deliveries = summary.deliveries,
            failures = summary.failures,
            "digest dispatch finished"
        );
        summary
    }

    async fn build_digest(
        &self,
        user_id: Uuid,
        organization_ids: &[Uuid],
        day: NaiveDate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<UserDigest>, NotifyError> {
        if organization_ids.is_empty() {
            return Ok(None);
        }
        let mut rows = self
            .results
            .results_created_between(organization_ids, from, to)
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        rows.sort_by(|a, b| b.total_score.cmp(&a.total_score));

        // The catalog omits closed opportunities, so filter before taking the top N.
        let ids = rows.iter().map(|r| r.opportunity_id).collect::<Vec<_>>();
        let opportunities = self
            .catalog
            .opportunities_by_ids(&ids)
            .await?
            .into_iter()
            .map(|o| (o.id, o))
            .collect::<HashMap<_, _>>();

        let candidates = rows.len();
        let live = rows
            .into_iter()
            .filter_map(|row| {
                let opportunity = opportunities.get(&row.opportunity_id)?;
                Some(digest_entry(row, opportunity))
            })
            .collect::<Vec<_>>();
        if live.len() < candidates {
            debug!(%user_id, dropped = candidates - live.len(), "skipping results for inactive opportunities");
        }
        let entries = live.into_iter().take(self.top_n).collect::<Vec<_>>();
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(UserDigest {
            user_id,
            date: day,
            entries,
        }))
    }
}

fn digest_entry(row: MatchingResult, opportunity: &OpportunityRecord) -> DigestEntry {
    DigestEntry {
        result_id: row.id,
        organization_id: row.organization_id,
        opportunity_id: row.opportunity_id,
        title: opportunity.title.clone(),
        organizer: opportunity.organizer.clone(),
        deadline: opportunity.deadline,
        is_permanent: opportunity.is_permanent,
        total_score: row.total_score,
        confidence: row.confidence,
        reasons: row.match_reasons,
    }
}
