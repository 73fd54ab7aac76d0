//! JSON API for the matching pipeline: cron entry points, preferences and results.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use gmr_core::{ConfidenceTier, FeedbackInput, MemberRole, PreferenceInput};
use gmr_storage::{PageRequest, PgStore, ResultFilter, StoreSet};
use gmr_sync::auth::{
    ADMIN_API_KEY_HEADER, WEBHOOK_SIGNATURE_HEADER, WEBHOOK_TIMESTAMP_HEADER,
    WORKER_CALLBACK_KEY_HEADER,
};
use gmr_sync::{
    prune_stale_results, AuthConfig, AuthError, DigestDispatcher, MatchingConfig,
    MatchingPipeline, PipelineError, RefreshOrchestrator, TriggerAuthenticator,
    TriggerCredentials,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gmr-web";

/// Caller identity, set by the upstream session layer.
pub const USER_ID_HEADER: &str = "x-user-id";

pub struct AppState {
    pub stores: StoreSet,
    pub pipeline: Arc<MatchingPipeline>,
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub digest: Arc<DigestDispatcher>,
    pub retention_days: i64,
}

#[derive(Debug, Deserialize, Default)]
struct ResultsQuery {
    page: Option<u32>,
    per_page: Option<u32>,
    min_confidence: Option<ConfidenceTier>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/cron/matching-refresh", post(cron_refresh_handler))
        .route("/api/cron/matching-notify", post(cron_notify_handler))
        .route("/api/cron/matching-prune", post(cron_prune_handler))
        .route(
            "/api/organizations/{id}/matching/preferences",
            get(get_preference_handler)
                .put(put_preference_handler)
                .delete(delete_preference_handler),
        )
        .route(
            "/api/organizations/{id}/matching/refresh",
            post(organization_refresh_handler),
        )
        .route(
            "/api/organizations/{id}/matching/results",
            get(list_results_handler),
        )
        .route("/api/matching/results/{id}", get(result_detail_handler))
        .route(
            "/api/matching/results/{id}/feedback",
            post(result_feedback_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> Result<()> {
    let port: u16 = std::env::var("GMR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let config = MatchingConfig::from_env();
    let store = PgStore::connect(&config.database_url, 10)
        .await
        .context("connecting web store")?;
    let stores = StoreSet::shared(Arc::new(store));
    let pipeline = Arc::new(config.pipeline(stores.clone())?);
    let orchestrator = config.orchestrator(
        pipeline.clone(),
        TriggerAuthenticator::new(AuthConfig::from_env()),
    )?;
    let digest = config.digest_dispatcher(&stores)?;

    let state = AppState {
        stores,
        pipeline,
        orchestrator: Arc::new(orchestrator),
        digest: Arc::new(digest),
        retention_days: config.retention_days,
    };
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn trigger_credentials(headers: &HeaderMap, body: &Bytes) -> TriggerCredentials {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    TriggerCredentials {
        bearer: header_value(header::AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer ").map(|t| t.trim().to_string())),
        admin_api_key: header_value(ADMIN_API_KEY_HEADER),
        worker_callback_key: header_value(WORKER_CALLBACK_KEY_HEADER),
        webhook_timestamp: header_value(WEBHOOK_TIMESTAMP_HEADER),
        webhook_signature: header_value(WEBHOOK_SIGNATURE_HEADER),
        body: body.to_vec(),
    }
}

fn authenticate_trigger(state: &AppState, headers: &HeaderMap, body: &Bytes) -> Result<(), Response> {
    state
        .orchestrator
        .authenticator()
        .authenticate(&trigger_credentials(headers, body), Utc::now())
        .map(|_| ())
        .map_err(auth_rejected)
}

async fn cron_refresh_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state
        .orchestrator
        .refresh(&trigger_credentials(&headers, &body))
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => auth_rejected(err),
    }
}

async fn cron_notify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejected) = authenticate_trigger(&state, &headers, &body) {
        return rejected;
    }
    Json(state.digest.dispatch(Utc::now()).await).into_response()
}

async fn cron_prune_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejected) = authenticate_trigger(&state, &headers, &body) {
        return rejected;
    }
    match prune_stale_results(state.stores.results.as_ref(), state.retention_days, Utc::now()).await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

/// Resolves the caller and their role in `organization_id`.
async fn require_member(
    state: &AppState,
    headers: &HeaderMap,
    organization_id: Uuid,
) -> Result<(Uuid, MemberRole), Response> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "missing or invalid x-user-id"))?;
    match state.stores.directory.member_role(user_id, organization_id).await {
        Ok(Some(role)) => Ok((user_id, role)),
        Ok(None) => Err(error_response(
            StatusCode::FORBIDDEN,
            "not a member of this organization",
        )),
        Err(err) => Err(server_error(err)),
    }
}

async fn get_preference_handler(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let (user_id, _) = match require_member(&state, &headers, organization_id).await {
        Ok(caller) => caller,
        Err(rejected) => return rejected,
    };
    match state
        .stores
        .preferences
        .get_preference(user_id, organization_id)
        .await
    {
        Ok(Some(preference)) => Json(preference).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no matching preference"),
        Err(err) => server_error(err),
    }
}

async fn put_preference_handler(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    headers: HeaderMap,
    Json(input): Json<PreferenceInput>,
) -> Response {
    let (user_id, role) = match require_member(&state, &headers, organization_id).await {
        Ok(caller) => caller,
        Err(rejected) => return rejected,
    };
    if !role.can_edit_preferences() {
        return error_response(StatusCode::FORBIDDEN, "role cannot edit matching preferences");
    }
    let input = match input.normalized() {
        Ok(input) => input,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    match state
        .stores
        .preferences
        .upsert_preference(user_id, organization_id, &input, Utc::now())
        .await
    {
        Ok(preference) => {
            info!(%organization_id, %user_id, categories = preference.categories.len(), "preference saved");
            Json(preference).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn delete_preference_handler(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let (user_id, role) = match require_member(&state, &headers, organization_id).await {
        Ok(caller) => caller,
        Err(rejected) => return rejected,
    };
    if !role.can_edit_preferences() {
        return error_response(StatusCode::FORBIDDEN, "role cannot edit matching preferences");
    }
    match state
        .stores
        .preferences
        .delete_preference(user_id, organization_id)
        .await
    {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "no matching preference"),
        Err(err) => server_error(err),
    }
}

async fn organization_refresh_handler(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let (user_id, _) = match require_member(&state, &headers, organization_id).await {
        Ok(caller) => caller,
        Err(rejected) => return rejected,
    };
    match state
        .pipeline
        .process_for_member(organization_id, user_id, Utc::now())
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(PipelineError::OrganizationNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "organization not found")
        }
        Err(err) => {
            warn!(%organization_id, error = %err, "on-demand refresh failed");
            error_response(StatusCode::BAD_GATEWAY, &err.to_string())
        }
    }
}

async fn list_results_handler(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejected) = require_member(&state, &headers, organization_id).await {
        return rejected;
    }
    let page = PageRequest {
        page: query.page,
        per_page: query.per_page,
    };
    let filter = ResultFilter {
        min_confidence: query.min_confidence,
    };
    match state
        .stores
        .results
        .list_results(organization_id, filter, page)
        .await
    {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err),
    }
}

async fn result_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(result_id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let result = match state.stores.results.get_result(result_id).await {
        Ok(Some(result)) => result,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "result not found"),
        Err(err) => return server_error(err),
    };
    if let Err(rejected) = require_member(&state, &headers, result.organization_id).await {
        return rejected;
    }
    Json(result).into_response()
}

async fn result_feedback_handler(
    State(state): State<Arc<AppState>>,
    Path(result_id): Path<Uuid>,
    headers: HeaderMap,
    Json(input): Json<FeedbackInput>,
) -> Response {
    let result = match state.stores.results.get_result(result_id).await {
        Ok(Some(result)) => result,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "result not found"),
        Err(err) => return server_error(err),
    };
    if let Err(rejected) = require_member(&state, &headers, result.organization_id).await {
        return rejected;
    }
    let feedback = match input.into_feedback(Utc::now()) {
        Ok(feedback) => feedback,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    match state.stores.results.set_feedback(result_id, &feedback).await {
        Ok(true) => Json(feedback).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "result not found"),
        Err(err) => server_error(err),
    }
}

fn auth_rejected(err: AuthError) -> Response {
    warn!(error = %err, "trigger rejected");
    error_response(StatusCode::UNAUTHORIZED, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gmr_core::{MatchingPreference, OpportunityRecord, OrganizationProfile};
    use gmr_scoring::{ScoringEngine, StoredVectorSimilarity};
    use gmr_storage::MemoryStore;
    use gmr_sync::{sign_webhook, DirectExecutor, PipelineSettings};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const CRON_SECRET: &str = "cron-secret";
    const SIGNING_KEY: &str = "signing-key";

    struct Fixture {
        store: Arc<MemoryStore>,
        organization_id: Uuid,
        owner: Uuid,
        viewer: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let organization_id = Uuid::new_v4();
        let (owner, viewer) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .insert_organization(OrganizationProfile {
                id: organization_id,
                name: "한빛테크".into(),
                category: Some("기술".into()),
                keywords: vec!["인공지능".into()],
                ..Default::default()
            })
            .await;
        store.add_member(organization_id, owner, MemberRole::Owner).await;
        store.add_member(organization_id, viewer, MemberRole::Viewer).await;
        store
            .insert_opportunity(OpportunityRecord {
                id: Uuid::new_v4(),
                title: "인공지능 기술개발 지원".into(),
                organizer: Some("중소벤처기업부".into()),
                category: Some("기술".into()),
                sub_category: None,
                eligibility_text: None,
                description: "인공지능 도입 지원".into(),
                region: None,
                min_amount: None,
                max_amount: None,
                deadline: None,
                is_permanent: true,
                posted_at: Some(Utc::now()),
            })
            .await;
        Fixture {
            store,
            organization_id,
            owner,
            viewer,
        }
    }

    fn state(store: Arc<MemoryStore>) -> AppState {
        let stores = StoreSet::shared(store);
        let pipeline = Arc::new(MatchingPipeline::new(
            stores.clone(),
            Arc::new(StoredVectorSimilarity::new(stores.embeddings.clone(), 100)),
            Arc::new(ScoringEngine::default()),
            PipelineSettings::default(),
        ));
        let authenticator = TriggerAuthenticator::new(AuthConfig {
            cron_secret: Some(CRON_SECRET.into()),
            webhook_signing_key: Some(SIGNING_KEY.into()),
            ..Default::default()
        });
        let orchestrator = RefreshOrchestrator::new(
            authenticator,
            stores.directory.clone(),
            DirectExecutor::new(pipeline.clone(), 50, Duration::from_secs(60)),
            None,
            20,
        );
        let digest = DigestDispatcher::new(
            stores.notifications.clone(),
            stores.results.clone(),
            stores.catalog.clone(),
            Vec::new(),
            5,
        );
        AppState {
            stores,
            pipeline,
            orchestrator: Arc::new(orchestrator),
            digest: Arc::new(digest),
            retention_days: 30,
        }
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn as_user(builder: axum::http::request::Builder, user: Uuid) -> axum::http::request::Builder {
        builder.header(USER_ID_HEADER, user.to_string())
    }

    #[tokio::test]
    async fn cron_refresh_rejects_missing_credentials() {
        let fx = fixture().await;
        let resp = app(state(fx.store.clone()))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cron/matching-refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(fx.store.result_count().await, 0);
    }

    #[tokio::test]
    async fn cron_refresh_with_bearer_returns_summary() {
        let fx = fixture().await;
        let resp = app(state(fx.store.clone()))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cron/matching-refresh")
                    .header(header::AUTHORIZATION, format!("Bearer {CRON_SECRET}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = json_body(resp).await;
        assert_eq!(summary["trigger"], "cron_secret");
        // No preference row exists, so the organization is not eligible.
        assert_eq!(summary["eligible"], 0);
    }

    #[tokio::test]
    async fn signed_webhook_authorizes_prune() {
        let fx = fixture().await;
        let body = br#"{"reason":"nightly"}"#;
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_webhook(SIGNING_KEY, &timestamp, body).unwrap();
        let resp = app(state(fx.store.clone()))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/cron/matching-prune")
                    .header(WEBHOOK_TIMESTAMP_HEADER, timestamp)
                    .header(WEBHOOK_SIGNATURE_HEADER, signature)
                    .body(Body::from(body.to_vec()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["removed"], 0);
    }

    #[tokio::test]
    async fn preferences_round_trip_for_owner() {
        let fx = fixture().await;
        let app = app(state(fx.store.clone()));
        let uri = format!("/api/organizations/{}/matching/preferences", fx.organization_id);

        let missing = app
            .clone()
            .oneshot(as_user(Request::builder().uri(&uri), fx.owner).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let put = app
            .clone()
            .oneshot(
                as_user(Request::builder().method("PUT").uri(&uri), fx.owner)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"categories":[" 기술 ","기술"],"regions":["서울"],"excluded_keywords":["해외"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(put.status(), StatusCode::OK);
        let saved = json_body(put).await;
        assert_eq!(saved["categories"], json!(["기술"]));

        let fetched = app
            .clone()
            .oneshot(as_user(Request::builder().uri(&uri), fx.owner).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);
        assert_eq!(json_body(fetched).await["excluded_keywords"], json!(["해외"]));

        let deleted = app
            .oneshot(
                as_user(Request::builder().method("DELETE").uri(&uri), fx.owner)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn preference_writes_are_role_gated_and_validated() {
        let fx = fixture().await;
        let app = app(state(fx.store.clone()));
        let uri = format!("/api/organizations/{}/matching/preferences", fx.organization_id);
        let put = |user: Uuid, body: &'static str| {
            as_user(Request::builder().method("PUT").uri(&uri), user)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let viewer = app
            .clone()
            .oneshot(put(fx.viewer, r#"{"categories":["기술"]}"#))
            .await
            .unwrap();
        assert_eq!(viewer.status(), StatusCode::FORBIDDEN);

        let outsider = app
            .clone()
            .oneshot(put(Uuid::new_v4(), r#"{"categories":["기술"]}"#))
            .await
            .unwrap();
        assert_eq!(outsider.status(), StatusCode::FORBIDDEN);

        let inverted = app
            .clone()
            .oneshot(put(
                fx.owner,
                r#"{"categories":["기술"],"min_amount":500,"max_amount":100}"#,
            ))
            .await
            .unwrap();
        assert_eq!(inverted.status(), StatusCode::BAD_REQUEST);

        let anonymous = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(&uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"categories":["기술"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn on_demand_refresh_then_list_detail_and_feedback() {
        let fx = fixture().await;
        let app = app(state(fx.store.clone()));
        let now = Utc::now();
        fx.store
            .insert_preference(MatchingPreference {
                id: Uuid::new_v4(),
                user_id: fx.owner,
                organization_id: fx.organization_id,
                categories: vec!["기술".into()],
                min_amount: None,
                max_amount: None,
                regions: Vec::new(),
                sub_regions: Vec::new(),
                excluded_keywords: Vec::new(),
                created_at: now,
                updated_at: now,
            })
            .await;

        let refresh = app
            .clone()
            .oneshot(
                as_user(
                    Request::builder()
                        .method("POST")
                        .uri(format!("/api/organizations/{}/matching/refresh", fx.organization_id)),
                    fx.owner,
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(refresh.status(), StatusCode::OK);
        let outcome = json_body(refresh).await;
        assert_eq!(outcome["stored"], 1);
        // No stored vectors, so similarity is unavailable.
        assert_eq!(outcome["mode"], "degraded");

        let list = app
            .clone()
            .oneshot(
                as_user(
                    Request::builder().uri(format!(
                        "/api/organizations/{}/matching/results?page=1&per_page=10",
                        fx.organization_id
                    )),
                    fx.viewer,
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(list.status(), StatusCode::OK);
        let page = json_body(list).await;
        assert_eq!(page["total"], 1);
        let result_id = page["items"][0]["id"].as_str().unwrap().to_string();

        let high_only = app
            .clone()
            .oneshot(
                as_user(
                    Request::builder().uri(format!(
                        "/api/organizations/{}/matching/results?min_confidence=high",
                        fx.organization_id
                    )),
                    fx.owner,
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(high_only).await["total"], 0);

        let detail = app
            .clone()
            .oneshot(
                as_user(
                    Request::builder().uri(format!("/api/matching/results/{result_id}")),
                    Uuid::new_v4(),
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(detail.status(), StatusCode::FORBIDDEN);

        let feedback = app
            .oneshot(
                as_user(
                    Request::builder()
                        .method("POST")
                        .uri(format!("/api/matching/results/{result_id}/feedback")),
                    fx.owner,
                )
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"relevant":true,"note":"지원 예정"}"#))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(feedback.status(), StatusCode::OK);
        let stored = fx.store.all_results().await;
        let saved = stored[0].feedback.as_ref().unwrap();
        assert!(saved.relevant);
        assert_eq!(saved.note.as_deref(), Some("지원 예정"));
    }
}
