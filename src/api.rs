//! HTTP surface.
//!
//! Thin axum handlers over the services. SQLite work runs on the blocking
//! pool; errors leave as `{ error, errorType, canRetry }`.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::db::{RenewalDb, SyncStatus, WorkingRenewal};
use crate::error::{ApiError, ErrorType, ServiceError};
use crate::services::renewals::OverlayPatch;
use crate::services::{history, renewals, seed};
use crate::state::AppState;
use crate::types::{Actor, Config, WORKING_TABLE};
use crate::workflow::reconcile::{self, ReconcileOptions};

type ApiFailure = (StatusCode, Json<ApiError>);
type ApiResult<T> = Result<T, ApiFailure>;

// =============================================================================
// Router
// =============================================================================

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/renewals", get(list_renewals).patch(update_renewal))
        .route("/api/renewals/stats", get(renewal_stats))
        .route("/api/account-managers", get(list_account_managers))
        .route("/api/sync/zone", post(trigger_sync).get(sync_history))
        .route("/api/seed", post(seed_sample_data))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

// =============================================================================
// Request / response shapes
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RenewalsQuery {
    #[serde(rename = "accountManager")]
    pub account_manager: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRenewalRequest {
    pub policy_id: Option<String>,
    pub marked_for_deletion: Option<bool>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

/// Echoes only the fields the request set; the full row is under `renewal`.
#[derive(Debug, Serialize)]
pub struct UpdateRenewalResponse {
    pub policy_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marked_for_deletion: Option<bool>,
    /// `Some(None)` when the request cleared the notes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<Option<String>>,
    pub updated_at: String,
    pub renewal: WorkingRenewal,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub message: String,
    pub sync: reconcile::SyncOutcome,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub history: Vec<crate::db::SyncHistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct SeedResponse {
    pub success: bool,
    pub message: String,
    pub renewals: usize,
    pub quotes: usize,
}

// =============================================================================
// Error mapping
// =============================================================================

fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::UpstreamStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        ServiceError::PartialSync { .. } => StatusCode::MULTI_STATUS,
    }
}

fn failure(err: ServiceError) -> ApiFailure {
    (status_for(&err), Json(ApiError::from(&err)))
}

fn plain_failure(status: StatusCode, error_type: ErrorType, message: &str) -> ApiFailure {
    (
        status,
        Json(ApiError {
            error: message.to_string(),
            error_type,
            can_retry: matches!(error_type, ErrorType::UpstreamStore | ErrorType::Conflict),
        }),
    )
}

/// Run store work on the blocking pool with the connection locked.
async fn with_db<T, F>(state: &Arc<AppState>, f: F) -> ApiResult<T>
where
    F: FnOnce(&RenewalDb, &Config) -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || {
        let db = state.db.lock();
        f(&db, &state.config)
    })
    .await
    .map_err(|e| {
        log::error!("Blocking store task failed: {}", e);
        plain_failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorType::UpstreamStore,
            "Internal error",
        )
    })?
    .map_err(failure)
}

// =============================================================================
// Handlers
// =============================================================================

async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sync_in_flight": state.sync_in_flight(),
    }))
}

async fn list_renewals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RenewalsQuery>,
) -> ApiResult<Json<DataResponse<Vec<renewals::RenewalView>>>> {
    let account_manager = query.account_manager.unwrap_or_default();
    let data = with_db(&state, move |db, config| {
        renewals::list_renewals(db, &account_manager, &config.unavailable_fields)
    })
    .await?;
    Ok(Json(DataResponse { data }))
}

async fn renewal_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RenewalsQuery>,
) -> ApiResult<Json<DataResponse<renewals::RenewalStats>>> {
    let account_manager = query.account_manager.unwrap_or_default();
    let today = Utc::now().date_naive();
    let data = with_db(&state, move |db, config| {
        renewals::renewal_stats(db, &account_manager, &config.unavailable_fields, today)
    })
    .await?;
    Ok(Json(DataResponse { data }))
}

async fn list_account_managers(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<DataResponse<Vec<String>>>> {
    let data = with_db(&state, |db, _| renewals::list_account_managers(db)).await?;
    Ok(Json(DataResponse { data }))
}

async fn update_renewal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<UpdateRenewalRequest>, JsonRejection>,
) -> ApiResult<Json<DataResponse<UpdateRenewalResponse>>> {
    let Json(request) = payload.map_err(|rejection| {
        plain_failure(
            StatusCode::BAD_REQUEST,
            ErrorType::Validation,
            &rejection.body_text(),
        )
    })?;

    let actor = headers
        .get(state.config.identity_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(Actor::new)
        .unwrap_or_else(|| Actor::new(""));
    let policy_id = request.policy_id.unwrap_or_default();
    let set_flag = request.marked_for_deletion.is_some();
    let set_notes = request.notes.is_some();
    let patch = OverlayPatch {
        marked_for_deletion: request.marked_for_deletion,
        notes: request.notes,
    };

    let renewal = with_db(&state, move |db, _| {
        let now = Utc::now().to_rfc3339();
        renewals::update_overlay(db, &policy_id, &patch, &actor, &now)
    })
    .await?;

    Ok(Json(DataResponse {
        data: UpdateRenewalResponse {
            policy_id: renewal.policy_id.clone(),
            marked_for_deletion: set_flag.then_some(renewal.overlay.marked_for_deletion),
            notes: set_notes.then(|| renewal.overlay.notes.clone()),
            updated_at: renewal.updated_at.clone(),
            renewal,
        },
    }))
}

async fn trigger_sync(State(state): State<Arc<AppState>>) -> Response {
    let worker = Arc::clone(&state);
    let joined = tokio::task::spawn_blocking(move || {
        let _guard = worker.try_begin_sync()?;
        let options = ReconcileOptions::from(&worker.config.sync);
        let db = worker.sync_db.lock();
        Some(reconcile::reconcile(&db, &options))
    })
    .await;

    let outcome = match joined {
        Ok(Some(outcome)) => outcome,
        Ok(None) => {
            log::warn!("Sync of {} rejected: a run is already in flight", WORKING_TABLE);
            return plain_failure(
                StatusCode::CONFLICT,
                ErrorType::Conflict,
                "A sync run is already in progress",
            )
            .into_response();
        }
        Err(e) => {
            log::error!("Sync task failed: {}", e);
            return plain_failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorType::UpstreamStore,
                "Internal error",
            )
            .into_response();
        }
    };

    let status = outcome
        .to_error()
        .map_or(StatusCode::OK, |err| status_for(&err));
    let body = SyncResponse {
        success: outcome.status == SyncStatus::Success,
        message: outcome.summary(),
        sync: outcome,
    };
    (status, Json(body)).into_response()
}

async fn sync_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let history = with_db(&state, move |db, config| {
        history::list_recent(db, WORKING_TABLE, query.limit, config.history_limit)
    })
    .await?;
    Ok(Json(HistoryResponse {
        success: true,
        history,
    }))
}

async fn seed_sample_data(State(state): State<Arc<AppState>>) -> ApiResult<Json<SeedResponse>> {
    if !state.config.enable_seed {
        return Err(plain_failure(
            StatusCode::NOT_FOUND,
            ErrorType::NotFound,
            "Not found",
        ));
    }

    let summary = with_db(&state, |db, _| {
        let now = Utc::now().to_rfc3339();
        seed::seed(db, &seed::sample_batch(&now), &now)
    })
    .await?;
    Ok(Json(SeedResponse {
        success: true,
        message: "Database seeded successfully".to_string(),
        renewals: summary.renewals,
        quotes: summary.quotes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{source_row, test_db};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::mpsc;
    use tower::ServiceExt;

    fn test_state(enable_seed: bool) -> Arc<AppState> {
        let config = Config {
            enable_seed,
            ..Config::default()
        };
        let db = test_db();
        let sync_db = db.reopen().unwrap();
        Arc::new(AppState::new(config, db, sync_db))
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = create_router(Arc::clone(state))
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn patch(body: serde_json::Value, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("PATCH")
            .uri("/api/renewals")
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let state = test_state(false);
        let (status, body) = send(&state, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sync_in_flight"], false);
    }

    #[tokio::test]
    async fn test_missing_account_manager_is_bad_request() {
        let state = test_state(false);
        let (status, body) = send(&state, get("/api/renewals")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorType"], "validation");
        assert_eq!(body["canRetry"], false);
    }

    #[tokio::test]
    async fn test_seed_disabled_is_not_found() {
        let state = test_state(false);
        let (status, _) = send(&state, post("/api/seed")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_seed_list_and_mark_for_deletion() {
        let state = test_state(true);
        let (status, body) = send(&state, post("/api/seed")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["renewals"], 5);
        assert_eq!(body["quotes"], 6);

        let (status, body) = send(&state, get("/api/renewals?accountManager=John%20Smith")).await;
        assert_eq!(status, StatusCode::OK);
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["policy_id"], "POL-2025-001");
        assert_eq!(data[0]["renewal_order"], 1);
        assert_eq!(data[1]["renewal_order"], 2);
        assert_eq!(data[0]["quotes"].as_array().unwrap().len(), 2);
        assert!(data[0]["notes"].is_null());

        let (status, body) = send(
            &state,
            patch(
                serde_json::json!({ "policy_id": "POL-2025-001", "marked_for_deletion": true }),
                Some("jane@example.com"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["marked_for_deletion"], true);
        assert!(body["data"].get("notes").is_none(), "notes were not set");
        assert_eq!(
            body["data"]["renewal"]["marked_for_deletion_by"],
            "jane@example.com"
        );

        let (_, body) = send(&state, get("/api/renewals?accountManager=John%20Smith")).await;
        let first = &body["data"][0];
        assert_eq!(first["marked_for_deletion"], true);
        assert!(first["marked_for_deletion_at"].is_string());
        assert_eq!(first["invoice_total"], 25000.0);
        assert_eq!(first["client_name"], "ABC Manufacturing Ltd");

        let (status, body) = send(&state, get("/api/account-managers")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_patch_errors() {
        let state = test_state(true);
        send(&state, post("/api/seed")).await;

        let (status, _) = send(
            &state,
            patch(serde_json::json!({ "notes": "x" }), Some("jane@example.com")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &state,
            patch(serde_json::json!({ "policy_id": "POL-2025-001", "notes": "x" }), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &state,
            patch(
                serde_json::json!({ "policy_id": "POL-404", "notes": "x" }),
                Some("jane@example.com"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errorType"], "not_found");
    }

    #[tokio::test]
    async fn test_sync_trigger_and_history() {
        let state = test_state(false);
        state
            .db
            .lock()
            .upsert_source_renewal(&source_row("POL-9", "Acme Ltd", 100.0))
            .unwrap();

        let (status, body) = send(&state, post("/api/sync/zone")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["sync"]["inserted"], 1);
        assert!(body["sync"]["history_id"].is_i64());

        let (status, body) = send(&state, get("/api/sync/zone?limit=0")).await;
        assert_eq!(status, StatusCode::OK);
        let history = body["history"].as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["status"], "success");
        assert_eq!(history[0]["rows_inserted"], 1);
    }

    #[tokio::test]
    async fn test_partial_sync_is_multi_status() {
        let state = test_state(false);
        {
            let db = state.db.lock();
            db.conn_ref()
                .execute_batch(
                    "CREATE TRIGGER reject_row BEFORE INSERT ON zone_working
                     WHEN NEW.policy_id = 'POL-BAD'
                     BEGIN SELECT RAISE(ABORT, 'rejected by store'); END;",
                )
                .unwrap();
            db.upsert_source_renewal(&source_row("POL-1", "Acme Ltd", 1.0))
                .unwrap();
            db.upsert_source_renewal(&source_row("POL-BAD", "Broken Co", 1.0))
                .unwrap();
        }

        let (status, body) = send(&state, post("/api/sync/zone")).await;
        assert_eq!(status, StatusCode::MULTI_STATUS);
        assert_eq!(body["success"], false);
        assert_eq!(body["sync"]["status"], "partial");
        assert_eq!(body["sync"]["row_errors"][0]["policy_id"], "POL-BAD");
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_rejected() {
        let state = test_state(false);
        let held = state.try_begin_sync().expect("slot free");

        let (status, body) = send(&state, post("/api/sync/zone")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errorType"], "conflict");
        drop(held);

        let (status, _) = send(&state, post("/api/sync/zone")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_patch_echoes_only_applied_fields() {
        let state = test_state(true);
        send(&state, post("/api/seed")).await;

        let (status, body) = send(
            &state,
            patch(
                serde_json::json!({ "policy_id": "POL-2025-002", "notes": "call broker" }),
                Some("jane@example.com"),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["notes"], "call broker");
        assert!(body["data"].get("marked_for_deletion").is_none());
        assert_eq!(body["data"]["renewal"]["marked_for_deletion"], false);

        let (_, body) = send(
            &state,
            patch(
                serde_json::json!({ "policy_id": "POL-2025-002", "notes": "" }),
                Some("jane@example.com"),
            ),
        )
        .await;
        let data = body["data"].as_object().unwrap();
        assert!(data.contains_key("notes"), "cleared notes are echoed as null");
        assert!(data["notes"].is_null());
    }

    /// Feed that blocks until the test releases it.
    struct GatedFeed {
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl reconcile::SourceFeed for GatedFeed {
        fn name(&self) -> &str {
            "gated"
        }

        fn fetch_all(&self) -> Result<Vec<crate::db::SourceRenewal>, crate::db::DbError> {
            let _ = self.started.send(());
            let _ = self.release.recv();
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_listing_completes_while_sync_in_flight() {
        let state = test_state(true);
        send(&state, post("/api/seed")).await;

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let worker = Arc::clone(&state);
        let run = std::thread::spawn(move || {
            let _guard = worker.try_begin_sync().expect("slot free");
            let feed = GatedFeed {
                started: started_tx,
                release: release_rx,
            };
            let db = worker.sync_db.lock();
            reconcile::run_reconciliation(&db, &feed, &ReconcileOptions::default())
        });
        started_rx.recv().unwrap();

        let (status, body) = send(&state, get("/api/renewals?accountManager=John%20Smith")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let (_, body) = send(&state, get("/healthz")).await;
        assert_eq!(body["sync_in_flight"], true);
        let (status, _) = send(&state, post("/api/sync/zone")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        release_tx.send(()).unwrap();
        let outcome = run.join().unwrap();
        assert_eq!(outcome.status, SyncStatus::Success);
        assert_eq!(outcome.orphaned, 5);
        assert!(!state.sync_in_flight());
    }
}
