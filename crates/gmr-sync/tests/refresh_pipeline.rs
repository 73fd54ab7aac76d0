use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use gmr_core::{
    ConfidenceTier, FeedbackInput, MatchingPreference, MemberRole, OpportunityRecord,
    OrganizationProfile, ScoringMode,
};
use gmr_scoring::{ScoringEngine, SimilarityError, SimilarityHit, SimilarityProvider};
use gmr_storage::{MemoryStore, ResultStore, StoreSet};
use gmr_sync::{
    AuthConfig, DelegatedExecutor, DelegationError, DirectExecutor, ExecutionStrategy,
    MatchingPipeline, PipelineError, PipelineSettings, RefreshOrchestrator, TriggerAuthenticator,
    TriggerCredentials, TriggerSource, WorkerAck, WorkerBatchRequest, WorkerDispatch,
    ACCEPTED_STATUS,
};
use uuid::Uuid;

#[derive(Default)]
struct ScriptedSimilarity {
    hits: HashMap<Uuid, Vec<SimilarityHit>>,
    failing: HashSet<Uuid>,
    calls: AtomicUsize,
}

#[async_trait]
impl SimilarityProvider for ScriptedSimilarity {
    async fn similar_opportunities(
        &self,
        organization_id: Uuid,
        _profile_text: &str,
        _limit: usize,
    ) -> Result<Vec<SimilarityHit>, SimilarityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&organization_id) {
            return Err(SimilarityError::InvalidResponse("index unavailable".into()));
        }
        Ok(self.hits.get(&organization_id).cloned().unwrap_or_default())
    }
}

struct CountingWorker {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingWorker {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail,
        })
    }
}

#[async_trait]
impl WorkerDispatch for CountingWorker {
    async fn dispatch(&self, _request: &WorkerBatchRequest) -> Result<WorkerAck, DelegationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DelegationError::Declined("busy".into()));
        }
        Ok(WorkerAck {
            status: ACCEPTED_STATUS.into(),
            batch_id: Uuid::new_v4(),
        })
    }
}

fn organization(name: &str) -> OrganizationProfile {
    OrganizationProfile {
        id: Uuid::new_v4(),
        name: name.into(),
        category: Some("기술".into()),
        keywords: vec!["인공지능".into()],
        description: Some("제조 현장 AI 품질검사 솔루션".into()),
        region: Some("서울".into()),
        employee_count: Some(25),
        annual_revenue: Some(500_000_000),
        certifications: vec!["벤처기업".into()],
        document_summaries: vec![],
    }
}

fn opportunity(title: &str, description: &str) -> OpportunityRecord {
    OpportunityRecord {
        id: Uuid::new_v4(),
        title: title.into(),
        organizer: Some("중소벤처기업부".into()),
        category: Some("기술".into()),
        sub_category: None,
        eligibility_text: Some("중소기업".into()),
        description: description.into(),
        region: Some("전국".into()),
        min_amount: Some(100_000_000),
        max_amount: Some(700_000_000),
        deadline: Some(Utc::now().date_naive() + Duration::days(10)),
        is_permanent: false,
        posted_at: None,
    }
}

fn preference(organization_id: Uuid, excluded: &[&str]) -> MatchingPreference {
    let now = Utc::now();
    MatchingPreference {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        organization_id,
        categories: vec!["기술".into()],
        min_amount: None,
        max_amount: None,
        regions: vec!["전국".into()],
        sub_regions: vec![],
        excluded_keywords: excluded.iter().map(|k| k.to_string()).collect(),
        created_at: now,
        updated_at: now,
    }
}

async fn enroll(store: &MemoryStore, org: &OrganizationProfile, excluded: &[&str]) -> MatchingPreference {
    store.insert_organization(org.clone()).await;
    let pref = preference(org.id, excluded);
    store.add_member(org.id, pref.user_id, MemberRole::Owner).await;
    store.insert_preference(pref.clone()).await;
    pref
}

fn pipeline(store: &Arc<MemoryStore>, similarity: Arc<ScriptedSimilarity>) -> Arc<MatchingPipeline> {
    Arc::new(MatchingPipeline::new(
        StoreSet::shared(store.clone()),
        similarity,
        Arc::new(ScoringEngine::default()),
        PipelineSettings::default(),
    ))
}

fn orchestrator(
    store: &Arc<MemoryStore>,
    similarity: Arc<ScriptedSimilarity>,
    worker: Option<Arc<CountingWorker>>,
    direct_max: usize,
) -> RefreshOrchestrator {
    let pipeline = pipeline(store, similarity);
    RefreshOrchestrator::new(
        TriggerAuthenticator::new(AuthConfig {
            cron_secret: Some("cron".into()),
            ..AuthConfig::default()
        }),
        store.clone(),
        DirectExecutor::new(pipeline, direct_max, StdDuration::from_secs(60)),
        worker.map(|w| DelegatedExecutor::new(w, 10, 500)),
        20,
    )
}

fn hit(opportunity: &OpportunityRecord, similarity: f64) -> SimilarityHit {
    SimilarityHit {
        opportunity_id: opportunity.id,
        similarity,
    }
}

#[tokio::test]
async fn strong_match_is_stored_with_high_confidence_and_reasons() {
    let store = Arc::new(MemoryStore::new());
    let org = organization("에이아이팩토리");
    enroll(&store, &org, &[]).await;
    let x = opportunity("AI 품질검사 기술개발 지원", "제조 현장 AI 품질검사 솔루션 고도화");
    store.insert_opportunity(x.clone()).await;

    let mut similarity = ScriptedSimilarity::default();
    similarity.hits.insert(org.id, vec![hit(&x, 0.92)]);
    let summary = orchestrator(&store, Arc::new(similarity), None, 50)
        .run(TriggerSource::Cli)
        .await;

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    let row = store.result_for_pair(org.id, x.id).await.expect("stored row");
    assert!(row.total_score >= 85, "total {}", row.total_score);
    assert_eq!(row.confidence, ConfidenceTier::High);
    assert_eq!(row.scoring_mode, ScoringMode::Full);
    assert!(row.match_reasons.iter().any(|r| r == "관심 분야 일치: 기술"));
    assert!(row.match_reasons.iter().any(|r| r == "마감 임박 (D-10)"));
}

#[tokio::test]
async fn excluded_keyword_pair_is_never_stored() {
    let store = Arc::new(MemoryStore::new());
    let b = organization("수출전문기업");
    enroll(&store, &b, &["해외"]).await;
    let y = opportunity("해외 전시회 참가 지원", "해외 판로 개척을 위한 기술 기업 지원");
    let z = opportunity("기술 사업화 지원", "국내 기술 기업 사업화 지원");
    store.insert_opportunity(y.clone()).await;
    store.insert_opportunity(z.clone()).await;

    let mut similarity = ScriptedSimilarity::default();
    similarity.hits.insert(b.id, vec![hit(&y, 1.0), hit(&z, 0.6)]);
    let summary = orchestrator(&store, Arc::new(similarity), None, 50)
        .run(TriggerSource::Cli)
        .await;

    assert_eq!(summary.failed, 0);
    assert!(store.result_for_pair(b.id, y.id).await.is_none());
    assert!(store.result_for_pair(b.id, z.id).await.is_some());
}

#[tokio::test]
async fn one_failing_similarity_lookup_fails_only_that_organization() {
    let store = Arc::new(MemoryStore::new());
    let x = opportunity("AI 바우처", "AI 솔루션 도입 지원");
    store.insert_opportunity(x.clone()).await;

    let mut similarity = ScriptedSimilarity::default();
    let mut orgs = Vec::new();
    for i in 0..4 {
        let org = organization(&format!("기업{i}"));
        enroll(&store, &org, &[]).await;
        similarity.hits.insert(org.id, vec![hit(&x, 0.8)]);
        orgs.push(org);
    }
    similarity.failing.insert(orgs[2].id);

    let summary = orchestrator(&store, Arc::new(similarity), None, 50)
        .run(TriggerSource::Cli)
        .await;

    assert_eq!(summary.processed, 4);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains(&orgs[2].id.to_string()));
    for (i, org) in orgs.iter().enumerate() {
        assert_eq!(store.result_for_pair(org.id, x.id).await.is_some(), i != 2);
    }
}

#[tokio::test]
async fn large_batch_is_delegated_once_without_local_iteration() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..21 {
        enroll(&store, &organization(&format!("기업{i}")), &[]).await;
    }
    let similarity = Arc::new(ScriptedSimilarity::default());
    let worker = CountingWorker::new(false);

    let summary = orchestrator(&store, similarity.clone(), Some(worker.clone()), 50)
        .run(TriggerSource::Cli)
        .await;

    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(similarity.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.strategy, Some(ExecutionStrategy::Delegate));
    assert!(summary.accepted);
    assert!(summary.worker_batch_id.is_some());
    assert_eq!(summary.eligible, 21);
    assert_eq!(summary.processed, 0);
    assert_eq!(store.result_count().await, 0);
}

#[tokio::test]
async fn small_batch_never_calls_worker() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..5 {
        enroll(&store, &organization(&format!("기업{i}")), &[]).await;
    }
    let worker = CountingWorker::new(false);
    let summary = orchestrator(&store, Arc::new(ScriptedSimilarity::default()), Some(worker.clone()), 50)
        .run(TriggerSource::Cli)
        .await;

    assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.strategy, Some(ExecutionStrategy::Direct));
    assert_eq!(summary.processed, 5);
}

#[tokio::test]
async fn failed_delegation_falls_back_to_direct_execution() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..21 {
        enroll(&store, &organization(&format!("기업{i}")), &[]).await;
    }
    let worker = CountingWorker::new(true);
    let summary = orchestrator(&store, Arc::new(ScriptedSimilarity::default()), Some(worker.clone()), 50)
        .run(TriggerSource::Cli)
        .await;

    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    assert!(summary.delegation_fallback);
    assert!(!summary.accepted);
    assert_eq!(summary.strategy, Some(ExecutionStrategy::Direct));
    assert_eq!(summary.processed, 21);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn direct_cap_defers_remaining_organizations() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..3 {
        enroll(&store, &organization(&format!("기업{i}")), &[]).await;
    }
    let summary = orchestrator(&store, Arc::new(ScriptedSimilarity::default()), None, 2)
        .run(TriggerSource::Cli)
        .await;
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.deferred, 1);
}

#[tokio::test]
async fn empty_directory_returns_empty_summary() {
    let store = Arc::new(MemoryStore::new());
    let summary = orchestrator(&store, Arc::new(ScriptedSimilarity::default()), None, 50)
        .run(TriggerSource::Cli)
        .await;
    assert_eq!(summary.eligible, 0);
    assert_eq!(summary.strategy, None);
    assert!(summary.errors.is_empty());
}

#[tokio::test]
async fn rerun_overwrites_in_place_and_keeps_feedback() {
    let store = Arc::new(MemoryStore::new());
    let org = organization("에이아이팩토리");
    enroll(&store, &org, &[]).await;
    let x = opportunity("AI 품질검사 기술개발 지원", "제조 AI");
    store.insert_opportunity(x.clone()).await;
    let mut similarity = ScriptedSimilarity::default();
    similarity.hits.insert(org.id, vec![hit(&x, 0.9)]);
    let orchestrator = orchestrator(&store, Arc::new(similarity), None, 50);

    orchestrator.run(TriggerSource::Cli).await;
    let first = store.result_for_pair(org.id, x.id).await.expect("first run row");
    let feedback = FeedbackInput {
        relevant: true,
        note: Some("좋은 추천".into()),
    }
    .into_feedback(Utc::now())
    .unwrap();
    assert!(store.set_feedback(first.id, &feedback).await.unwrap());

    orchestrator.run(TriggerSource::Cli).await;
    let second = store.result_for_pair(org.id, x.id).await.expect("second run row");
    assert_eq!(store.result_count().await, 1);
    assert_eq!(second.id, first.id);
    assert_eq!(second.total_score, first.total_score);
    assert_eq!(second.sub_scores, first.sub_scores);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second.feedback.map(|f| f.relevant), Some(true));
}

#[tokio::test]
async fn organization_without_preference_is_a_pipeline_failure() {
    let store = Arc::new(MemoryStore::new());
    let org = organization("미설정기업");
    store.insert_organization(org.clone()).await;
    let pipeline = pipeline(&store, Arc::new(ScriptedSimilarity::default()));
    let err = pipeline
        .process_organization(org.id, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::MissingPreference(id) if id == org.id));
}

#[tokio::test]
async fn member_without_preference_gets_degraded_results() {
    let store = Arc::new(MemoryStore::new());
    let org = organization("에이아이팩토리");
    store.insert_organization(org.clone()).await;
    let user = Uuid::new_v4();
    store.add_member(org.id, user, MemberRole::Member).await;
    let mut x = opportunity("인공지능 기술 실증 지원", "인공지능 기술 실증");
    x.posted_at = Some(Utc::now());
    store.insert_opportunity(x.clone()).await;

    let similarity = Arc::new(ScriptedSimilarity::default());
    let outcome = pipeline(&store, similarity.clone())
        .process_for_member(org.id, user, Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome.mode, ScoringMode::Degraded);
    assert_eq!(outcome.stored, 1);
    assert_eq!(similarity.calls.load(Ordering::SeqCst), 0);

    let row = store.result_for_pair(org.id, x.id).await.unwrap();
    assert_eq!(row.scoring_mode, ScoringMode::Degraded);
    assert!(row.total_score <= 80);
    assert!(row.confidence <= ConfidenceTier::Medium);
    assert_eq!(row.user_id, user);
}

#[tokio::test]
async fn refresh_rejects_unauthenticated_triggers() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(&store, Arc::new(ScriptedSimilarity::default()), None, 50);
    assert!(orchestrator.refresh(&TriggerCredentials::default()).await.is_err());

    let summary = orchestrator
        .refresh(&TriggerCredentials {
            bearer: Some("cron".into()),
            ..TriggerCredentials::default()
        })
        .await
        .unwrap();
    assert_eq!(summary.trigger, TriggerSource::CronSecret);
}
