//! Chunked, memory-aware execution of delegated matching batches.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gmr_sync::MatchingPipeline;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::embeddings::{EmbeddingBatchRunner, EmbeddingReport};
use crate::health::MemoryProbe;

pub const DEFAULT_CHUNK_SIZE: usize = 10;
pub const DEFAULT_CHUNK_PAUSE: Duration = Duration::from_secs(3);

/// Organizations per chunk and the pause between chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceThrottle {
    pub chunk_size: usize,
    pub pause: Duration,
}

impl Default for ResourceThrottle {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pause: DEFAULT_CHUNK_PAUSE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub organizations: usize,
    pub chunks: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stored: usize,
    pub errors: Vec<String>,
    pub memory_before_mb: Option<u64>,
    pub memory_after_mb: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    /// Report for a batch whose task died before producing its own.
    fn aborted(batch_id: Uuid, organizations: usize, started_at: DateTime<Utc>, reason: String) -> Self {
        Self {
            batch_id,
            organizations,
            chunks: 0,
            processed: 0,
            succeeded: 0,
            failed: organizations,
            stored: 0,
            errors: vec![reason],
            memory_before_mb: None,
            memory_after_mb: None,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

pub struct ChunkedBatchRunner {
    pipeline: Arc<MatchingPipeline>,
    probe: Arc<dyn MemoryProbe>,
    throttle: ResourceThrottle,
}

impl ChunkedBatchRunner {
    pub fn new(
        pipeline: Arc<MatchingPipeline>,
        probe: Arc<dyn MemoryProbe>,
        throttle: ResourceThrottle,
    ) -> Self {
        Self {
            pipeline,
            probe,
            throttle: ResourceThrottle {
                chunk_size: throttle.chunk_size.max(1),
                pause: throttle.pause,
            },
        }
    }

    pub fn throttle(&self) -> ResourceThrottle {
        self.throttle
    }

    pub fn pipeline(&self) -> &Arc<MatchingPipeline> {
        &self.pipeline
    }

    /// Processes every organization, one chunk at a time. A failing
    /// organization is recorded and the batch moves on.
    pub async fn run(&self, batch_id: Uuid, organization_ids: &[Uuid]) -> BatchReport {
        let started_at = Utc::now();
        let memory_before_mb = self.probe.resident_mb();
        let mut report = BatchReport {
            batch_id,
            organizations: organization_ids.len(),
            chunks: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            stored: 0,
            errors: Vec::new(),
            memory_before_mb,
            memory_after_mb: None,
            started_at,
            finished_at: started_at,
        };
        info!(%batch_id, organizations = report.organizations, chunk_size = self.throttle.chunk_size, ?memory_before_mb, "worker batch started");

        let chunk_count = organization_ids.len().div_ceil(self.throttle.chunk_size);
        for (index, chunk) in organization_ids.chunks(self.throttle.chunk_size).enumerate() {
            let chunk_memory = self.probe.resident_mb();
            for organization_id in chunk {
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
                        warn!(%batch_id, %organization_id, error = %err, "organization failed in worker batch");
                        report.failed += 1;
                        report.errors.push(format!("{organization_id}: {err}"));
                    }
                }
            }
            report.chunks += 1;
            info!(
                %batch_id,
                chunk = index + 1,
                of = chunk_count,
                memory_before_mb = ?chunk_memory,
                memory_after_mb = ?self.probe.resident_mb(),
                "chunk complete"
            );
            if index + 1 < chunk_count && !self.throttle.pause.is_zero() {
                tokio::time::sleep(self.throttle.pause).await;
            }
        }

        report.memory_after_mb = self.probe.resident_mb();
        report.finished_at = Utc::now();
        info!(
            %batch_id,
            succeeded = report.succeeded,
            failed = report.failed,
            stored = report.stored,
            memory_after_mb = ?report.memory_after_mb,
            "worker batch finished"
        );
        report
    }
}

/// Background work bookkeeping shared by the HTTP handlers.
#[derive(Default)]
pub struct BatchTracker {
    active: AtomicUsize,
    idle: Notify,
    last_batch: RwLock<Option<BatchReport>>,
    last_embedding_run: RwLock<Option<EmbeddingReport>>,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call before spawning so `wait_idle` never misses the job.
    pub fn begin(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn finish_batch(&self, report: BatchReport) {
        *self.last_batch.write().await = Some(report);
        self.release();
    }

    pub async fn finish_embeddings(&self, report: EmbeddingReport) {
        *self.last_embedding_run.write().await = Some(report);
        self.release();
    }

    /// Runs the batch on its own task. The slot is released and a report
    /// recorded even when the run panics.
    pub fn spawn_batch(
        self: &Arc<Self>,
        runner: Arc<ChunkedBatchRunner>,
        batch_id: Uuid,
        organization_ids: Vec<Uuid>,
    ) {
        self.begin();
        let tracker = self.clone();
        tokio::spawn(async move {
            let organizations = organization_ids.len();
            let started_at = Utc::now();
            let run = tokio::spawn(async move { runner.run(batch_id, &organization_ids).await });
            let report = match run.await {
                Ok(report) => report,
                Err(err) => {
                    error!(%batch_id, error = %err, "worker batch task aborted");
                    BatchReport::aborted(batch_id, organizations, started_at, err.to_string())
                }
            };
            tracker.finish_batch(report).await;
        });
    }

    pub fn spawn_embeddings(self: &Arc<Self>, runner: Arc<EmbeddingBatchRunner>) {
        self.begin();
        let tracker = self.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(async move { runner.run(Utc::now()).await });
            let report = match run.await {
                Ok(report) => report,
                Err(err) => {
                    error!(error = %err, "embedding task aborted");
                    EmbeddingReport {
                        errors: vec![err.to_string()],
                        ..EmbeddingReport::default()
                    }
                }
            };
            tracker.finish_embeddings(report).await;
        });
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn last_batch(&self) -> Option<BatchReport> {
        self.last_batch.read().await.clone()
    }

    pub async fn last_embedding_run(&self) -> Option<EmbeddingReport> {
        self.last_embedding_run.read().await.clone()
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}
