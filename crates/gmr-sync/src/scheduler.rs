//! External-timer process: fires the cron endpoints on schedule.

use anyhow::{Context, Result};
use gmr_storage::JsonHttpClient;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::auth::non_empty_env;

pub const REFRESH_PATH: &str = "/api/cron/matching-refresh";
pub const NOTIFY_PATH: &str = "/api/cron/matching-notify";
pub const PRUNE_PATH: &str = "/api/cron/matching-prune";

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub refresh_cron: String,
    pub notify_cron: String,
    pub prune_cron: String,
    pub endpoint_base_url: String,
    pub cron_secret: Option<String>,
}

impl ScheduleConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("REFRESH_CRON").unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            notify_cron: std::env::var("NOTIFY_CRON").unwrap_or_else(|_| "0 0 23 * * *".to_string()),
            prune_cron: std::env::var("PRUNE_CRON").unwrap_or_else(|_| "0 30 19 * * *".to_string()),
            endpoint_base_url: std::env::var("REFRESH_ENDPOINT_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            cron_secret: non_empty_env("CRON_SECRET"),
        }
    }

    /// `(cron expression, absolute url)` per scheduled endpoint.
    pub fn targets(&self) -> Vec<(String, String)> {
        let base = self.endpoint_base_url.trim_end_matches('/');
        [
            (&self.refresh_cron, REFRESH_PATH),
            (&self.notify_cron, NOTIFY_PATH),
            (&self.prune_cron, PRUNE_PATH),
        ]
        .into_iter()
        .map(|(cron, path)| (cron.clone(), format!("{base}{path}")))
        .collect()
    }
}

pub async fn maybe_build_scheduler(
    config: &ScheduleConfig,
    client: JsonHttpClient,
) -> Result<Option<JobScheduler>> {
    if !config.enabled {
        return Ok(None);
    }
    let secret = config
        .cron_secret
        .clone()
        .context("CRON_SECRET is required when the scheduler is enabled")?;

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (cron, url) in config.targets() {
        let client = client.clone();
        let secret = secret.clone();
        let target = url.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let client = client.clone();
            let secret = secret.clone();
            let url = target.clone();
            Box::pin(async move {
                match client
                    .post_json_discard(&url, Some(secret.as_str()), &serde_json::json!({}))
                    .await
                {
                    Ok(status) => info!(%url, status = status.as_u16(), "scheduled trigger sent"),
                    Err(err) => warn!(%url, error = %err, "scheduled trigger failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, %url, "scheduled endpoint");
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_join_base_url_and_paths() {
        let config = ScheduleConfig {
            enabled: true,
            refresh_cron: "0 0 18 * * *".into(),
            notify_cron: "0 0 23 * * *".into(),
            prune_cron: "0 30 19 * * *".into(),
            endpoint_base_url: "https://api.example.com/".into(),
            cron_secret: Some("s".into()),
        };
        let targets = config.targets();
        assert_eq!(targets.len(), 3);
        assert_eq!(
            targets[0],
            (
                "0 0 18 * * *".to_string(),
                "https://api.example.com/api/cron/matching-refresh".to_string()
            )
        );
        assert!(targets[2].1.ends_with("/api/cron/matching-prune"));
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = ScheduleConfig {
            enabled: false,
            refresh_cron: "bad".into(),
            notify_cron: "bad".into(),
            prune_cron: "bad".into(),
            endpoint_base_url: String::new(),
            cron_secret: None,
        };
        let client = JsonHttpClient::new(Default::default()).unwrap();
        assert!(maybe_build_scheduler(&config, client).await.unwrap().is_none());
    }
}
