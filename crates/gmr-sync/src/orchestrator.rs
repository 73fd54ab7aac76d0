//! Batch orchestration: strategy decision, direct and delegated executors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gmr_storage::{HttpError, JsonHttpClient, OrganizationDirectory};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::{AuthError, TriggerAuthenticator, TriggerCredentials, TriggerSource};
use crate::pipeline::MatchingPipeline;

pub const DEFAULT_FANOUT_THRESHOLD: usize = 20;
pub const DEFAULT_DIRECT_MAX_ORGS: usize = 50;
pub const DEFAULT_REQUEST_BUDGET: Duration = Duration::from_secs(60);
pub const DEFAULT_WORKER_BATCH_SIZE: usize = 10;
pub const DEFAULT_WORKER_MAX_ORGS: usize = 500;

/// Portion of the request budget left unused as headroom for the response.
const BUDGET_SAFETY_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Direct,
    Delegate,
}

/// Delegate only when the batch is large and a worker is reachable.
pub fn decide_strategy(
    eligible: usize,
    worker_available: bool,
    fanout_threshold: usize,
) -> ExecutionStrategy {
    if eligible > fanout_threshold && worker_available {
        ExecutionStrategy::Delegate
    } else {
        ExecutionStrategy::Direct
    }
}

#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub run_id: Uuid,
    pub organization_ids: Vec<Uuid>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub stored: usize,
    pub errors: Vec<String>,
    pub accepted: bool,
    pub worker_batch_id: Option<Uuid>,
}

#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("worker request failed: {0}")]
    Http(#[from] HttpError),
    #[error("worker declined the batch: {0}")]
    Declined(String),
}

#[async_trait]
pub trait BatchExecutor: Send + Sync {
    fn strategy(&self) -> ExecutionStrategy;

    async fn execute(&self, plan: &BatchPlan) -> Result<ExecutionReport, DelegationError>;
}

/// Sequential in-process execution bounded by an organization cap and a wall-clock budget.
#[derive(Clone)]
pub struct DirectExecutor {
    pipeline: Arc<MatchingPipeline>,
    max_organizations: usize,
    budget: Duration,
}

impl DirectExecutor {
    pub fn new(pipeline: Arc<MatchingPipeline>, max_organizations: usize, budget: Duration) -> Self {
        Self {
            pipeline,
            max_organizations,
            budget,
        }
    }

    pub async fn run(&self, plan: &BatchPlan) -> ExecutionReport {
        let started = Instant::now();
        let deadline = self.budget.saturating_sub(BUDGET_SAFETY_MARGIN);
        let mut report = ExecutionReport::default();

        for (index, organization_id) in plan.organization_ids.iter().enumerate() {
            if index >= self.max_organizations || started.elapsed() >= deadline {
                report.deferred = plan.organization_ids.len() - index;
                break;
            }
            report.processed += 1;
            match self
                .pipeline
                .process_organization(*organization_id, Utc::now())
                .await
            {
                Ok(outcome) => {
                    report.succeeded += 1;
                    report.stored += outcome.stored;
                }
                Err(err) => {
                    error!(%organization_id, error = %err, "organization refresh failed");
                    report.failed += 1;
                    report.errors.push(format!("{organization_id}: {err}"));
                }
            }
        }
        report
    }
}

#[async_trait]
impl BatchExecutor for DirectExecutor {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Direct
    }

    async fn execute(&self, plan: &BatchPlan) -> Result<ExecutionReport, DelegationError> {
        Ok(self.run(plan).await)
    }
}

/// Body of `POST /matching/batch` on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBatchRequest {
    pub batch_size: usize,
    pub max_organizations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAck {
    pub status: String,
    pub batch_id: Uuid,
}

pub const ACCEPTED_STATUS: &str = "accepted";

#[async_trait]
pub trait WorkerDispatch: Send + Sync {
    async fn dispatch(&self, request: &WorkerBatchRequest) -> Result<WorkerAck, DelegationError>;
}

#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: JsonHttpClient,
    base_url: String,
    secret: String,
}

impl HttpWorkerClient {
    pub fn new(client: JsonHttpClient, base_url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl WorkerDispatch for HttpWorkerClient {
    async fn dispatch(&self, request: &WorkerBatchRequest) -> Result<WorkerAck, DelegationError> {
        let url = format!("{}/matching/batch", self.base_url);
        let ack: WorkerAck = self
            .client
            .post_json(&url, Some(self.secret.as_str()), request)
            .await?;
        if ack.status != ACCEPTED_STATUS {
            return Err(DelegationError::Declined(ack.status));
        }
        Ok(ack)
    }
}

/// Fire-and-forget hand-off; the worker discovers organizations itself.
#[derive(Clone)]
pub struct DelegatedExecutor {
    dispatch: Arc<dyn WorkerDispatch>,
    request: WorkerBatchRequest,
}

impl DelegatedExecutor {
    pub fn new(dispatch: Arc<dyn WorkerDispatch>, batch_size: usize, max_organizations: usize) -> Self {
        Self {
            dispatch,
            request: WorkerBatchRequest {
                batch_size,
                max_organizations,
            },
        }
    }
}

#[async_trait]
impl BatchExecutor for DelegatedExecutor {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Delegate
    }

    async fn execute(&self, _plan: &BatchPlan) -> Result<ExecutionReport, DelegationError> {
        let ack = self.dispatch.dispatch(&self.request).await?;
        Ok(ExecutionReport {
            accepted: true,
            worker_batch_id: Some(ack.batch_id),
            ..ExecutionReport::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub trigger: TriggerSource,
    pub strategy: Option<ExecutionStrategy>,
    pub eligible: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deferred: usize,
    pub stored: usize,
    pub errors: Vec<String>,
    pub accepted: bool,
    pub worker_batch_id: Option<Uuid>,
    pub delegation_fallback: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RefreshSummary {
    fn empty(run_id: Uuid, trigger: TriggerSource, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            trigger,
            strategy: None,
            eligible: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            deferred: 0,
            stored: 0,
            errors: Vec::new(),
            accepted: false,
            worker_batch_id: None,
            delegation_fallback: false,
            started_at,
            finished_at: started_at,
        }
    }

    fn absorb(&mut self, report: ExecutionReport) {
        self.processed += report.processed;
        self.succeeded += report.succeeded;
        self.failed += report.failed;
        self.deferred = report.deferred;
        self.stored += report.stored;
        self.errors.extend(report.errors);
        self.accepted = report.accepted;
        self.worker_batch_id = report.worker_batch_id;
    }
}

pub struct RefreshOrchestrator {
    authenticator: TriggerAuthenticator,
    directory: Arc<dyn OrganizationDirectory>,
    direct: DirectExecutor,
    delegated: Option<DelegatedExecutor>,
    fanout_threshold: usize,
}

impl RefreshOrchestrator {
    pub fn new(
        authenticator: TriggerAuthenticator,
        directory: Arc<dyn OrganizationDirectory>,
        direct: DirectExecutor,
        delegated: Option<DelegatedExecutor>,
        fanout_threshold: usize,
    ) -> Self {
        Self {
            authenticator,
            directory,
            direct,
            delegated,
            fanout_threshold,
        }
    }

    pub fn authenticator(&self) -> &TriggerAuthenticator {
        &self.authenticator
    }

    /// Authenticate, then run. Only authentication failures are errors.
    pub async fn refresh(
        &self,
        credentials: &TriggerCredentials,
    ) -> Result<RefreshSummary, AuthError> {
        let trigger = self.authenticator.authenticate(credentials, Utc::now())?;
        Ok(self.run(trigger).await)
    }

    pub async fn run(&self, trigger: TriggerSource) -> RefreshSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("matching_refresh", %run_id, trigger = trigger.as_str());
        self.run_inner(run_id, trigger).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, trigger: TriggerSource) -> RefreshSummary {
        let started_at = Utc::now();
        let mut summary = RefreshSummary::empty(run_id, trigger, started_at);

        let organization_ids = match self.directory.eligible_organization_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                error!(error = %err, "listing eligible organizations failed");
                summary.errors.push(format!("listing eligible organizations: {err}"));
                summary.finished_at = Utc::now();
                return summary;
            }
        };
        summary.eligible = organization_ids.len();
        if organization_ids.is_empty() {
            info!("no eligible organizations");
            summary.finished_at = Utc::now();
            return summary;
        }

        let plan = BatchPlan {
            run_id,
            organization_ids,
            started_at,
        };
        let strategy = decide_strategy(
            summary.eligible,
            self.delegated.is_some(),
            self.fanout_threshold,
        );

        let executor: &dyn BatchExecutor = match (&self.delegated, strategy) {
            (Some(delegated), ExecutionStrategy::Delegate) => delegated as &dyn BatchExecutor,
            _ => &self.direct as &dyn BatchExecutor,
        };
        summary.strategy = Some(executor.strategy());
        match executor.execute(&plan).await {
            Ok(report) => summary.absorb(report),
            Err(err) => {
                warn!(error = %err, "delegation failed; falling back to direct execution");
                summary.delegation_fallback = true;
                summary.strategy = Some(ExecutionStrategy::Direct);
                summary.absorb(self.direct.run(&plan).await);
            }
        }

        summary.finished_at = Utc::now();
        info!(
            eligible = summary.eligible,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            deferred = summary.deferred,
            accepted = summary.accepted,
            fallback = summary.delegation_fallback,
            "matching refresh finished"
        );
        summary
    }
}
