//! HTTP API endpoints

mod metrics;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use pagestore_core::command::{AdminCommand, CommandOutput};
use pagestore_core::storage::{CreateTimeline, TenantConf, TenantRegistry, TenantStatus, TimelineDetail};
use pagestore_core::{Delta, Lsn, PageStoreError, TenantId, TimelineId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
pub type AppState = Arc<TenantRegistry>;

/// Create the API router
pub fn create_router(registry: Arc<TenantRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/status", get(status))
        .route("/metrics", get(metrics::render))

        // Tenants
        .route("/v1/tenant", get(list_tenants).post(create_tenant))
        .route("/v1/tenant/:tenant_id", get(tenant_status))

        // Timelines
        .route("/v1/tenant/:tenant_id/timeline", get(list_timelines).post(create_timeline))
        .route(
            "/v1/tenant/:tenant_id/timeline/:timeline_id",
            get(timeline_detail).delete(delete_timeline),
        )

        // Ingest and waits
        .route("/v1/tenant/:tenant_id/timeline/:timeline_id/ingest", post(ingest))
        .route("/v1/tenant/:tenant_id/timeline/:timeline_id/flush_lsn", post(flush_lsn))
        .route("/v1/tenant/:tenant_id/timeline/:timeline_id/wait_lsn", get(wait_lsn))
        .route("/v1/tenant/:tenant_id/timeline/:timeline_id/wait_for_upload", get(wait_for_upload))

        // Admin commands
        .route("/v1/tenant/:tenant_id/timeline/:timeline_id/checkpoint", post(checkpoint))
        .route("/v1/tenant/:tenant_id/timeline/:timeline_id/compact", post(compact))
        .route("/v1/tenant/:tenant_id/timeline/:timeline_id/do_gc", post(do_gc))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Storage(#[from] PageStoreError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        let err = match self {
            ApiError::BadRequest(_) => return StatusCode::BAD_REQUEST,
            ApiError::Storage(err) => err,
        };
        match err {
            PageStoreError::TenantNotFound(_) | PageStoreError::TimelineNotFound(_) => StatusCode::NOT_FOUND,
            PageStoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            PageStoreError::OutOfOrderLsn { .. }
            | PageStoreError::InvalidFormat(_)
            | PageStoreError::InvalidBranch(_)
            | PageStoreError::LsnBelowGcCutoff { .. }
            | PageStoreError::Config(_) => StatusCode::BAD_REQUEST,
            PageStoreError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            PageStoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PageStoreError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run a synchronous engine call off the async workers
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> pagestore_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Storage(PageStoreError::Internal(e.to_string())))?
        .map_err(ApiError::from)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub tenant_count: usize,
}

/// Tenant creation; every other field overrides the default tenant settings
#[derive(Debug, Default, Deserialize)]
pub struct TenantCreateRequest {
    #[serde(default)]
    pub new_tenant_id: Option<TenantId>,
    #[serde(flatten)]
    pub conf: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct DetailParams {
    #[serde(default, rename = "include-non-incremental-logical-size")]
    include_non_incremental: bool,
}

/// One entry of an ingest batch
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestRecord {
    pub lsn: Lsn,
    pub delta: Delta,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub last_record_lsn: Lsn,
    pub current_logical_size: u64,
}

#[derive(Debug, Deserialize)]
pub struct FlushLsnRequest {
    pub lsn: Lsn,
}

#[derive(Debug, Deserialize)]
pub struct WaitParams {
    pub lsn: Lsn,
    #[serde(default = "default_wait_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_wait_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
pub struct GcParams {
    pub pitr_seconds: u64,
}

// ============================================================================
// Handlers
// ============================================================================

async fn status(State(registry): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: pagestore_core::VERSION.to_string(),
        tenant_count: registry.list_tenants().len(),
    })
}

async fn list_tenants(State(registry): State<AppState>) -> Json<Vec<TenantId>> {
    Json(registry.list_tenants().iter().map(|t| t.id()).collect())
}

async fn create_tenant(
    State(registry): State<AppState>,
    body: Option<Json<TenantCreateRequest>>,
) -> ApiResult<(StatusCode, Json<TenantId>)> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let conf = if request.conf.is_empty() {
        None
    } else {
        Some(merge_tenant_conf(&registry.config().default_tenant_conf, request.conf)?)
    };
    let tenant_id = blocking(move || registry.create_tenant(request.new_tenant_id, conf)).await?.id();
    Ok((StatusCode::CREATED, Json(tenant_id)))
}

/// Apply JSON overrides on top of `base`
fn merge_tenant_conf(
    base: &TenantConf,
    overrides: serde_json::Map<String, serde_json::Value>,
) -> ApiResult<TenantConf> {
    let mut value = serde_json::to_value(base).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if let serde_json::Value::Object(fields) = &mut value {
        fields.extend(overrides);
    }
    serde_json::from_value(value).map_err(|e| ApiError::BadRequest(format!("Invalid tenant config: {}", e)))
}

async fn tenant_status(
    State(registry): State<AppState>,
    Path(tenant_id): Path<TenantId>,
) -> ApiResult<Json<TenantStatus>> {
    Ok(Json(registry.get_tenant(tenant_id)?.status()))
}

async fn create_timeline(
    State(registry): State<AppState>,
    Path(tenant_id): Path<TenantId>,
    body: Option<Json<CreateTimeline>>,
) -> ApiResult<(StatusCode, Json<TimelineDetail>)> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let detail = blocking(move || registry.create_timeline(tenant_id, request)?.detail(false)).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn list_timelines(
    State(registry): State<AppState>,
    Path(tenant_id): Path<TenantId>,
    Query(params): Query<DetailParams>,
) -> ApiResult<Json<Vec<TimelineDetail>>> {
    let tenant = registry.get_tenant(tenant_id)?;
    let details = blocking(move || {
        tenant
            .list_timelines()
            .iter()
            .map(|t| t.detail(params.include_non_incremental))
            .collect()
    })
    .await?;
    Ok(Json(details))
}

async fn timeline_detail(
    State(registry): State<AppState>,
    Path((tenant_id, timeline_id)): Path<(TenantId, TimelineId)>,
    Query(params): Query<DetailParams>,
) -> ApiResult<Json<TimelineDetail>> {
    let timeline = registry.get_timeline(tenant_id, timeline_id)?;
    let detail = blocking(move || timeline.detail(params.include_non_incremental)).await?;
    Ok(Json(detail))
}

async fn delete_timeline(
    State(registry): State<AppState>,
    Path((tenant_id, timeline_id)): Path<(TenantId, TimelineId)>,
) -> ApiResult<StatusCode> {
    registry.delete_timeline(tenant_id, timeline_id).await?;
    Ok(StatusCode::OK)
}

/// Consecutive records sharing an LSN form one batch
fn group_by_lsn(records: Vec<IngestRecord>) -> Vec<(Lsn, Vec<Delta>)> {
    let mut batches: Vec<(Lsn, Vec<Delta>)> = Vec::new();
    for record in records {
        match batches.last_mut() {
            Some((lsn, deltas)) if *lsn == record.lsn => deltas.push(record.delta),
            _ => batches.push((record.lsn, vec![record.delta])),
        }
    }
    batches
}

async fn ingest(
    State(registry): State<AppState>,
    Path((tenant_id, timeline_id)): Path<(TenantId, TimelineId)>,
    Json(records): Json<Vec<IngestRecord>>,
) -> ApiResult<Json<IngestResponse>> {
    let timeline = registry.get_timeline(tenant_id, timeline_id)?;
    let response = blocking(move || {
        for (lsn, deltas) in group_by_lsn(records) {
            timeline.ingest(lsn, &deltas)?;
        }
        Ok(IngestResponse {
            last_record_lsn: timeline.last_record_lsn(),
            current_logical_size: timeline.logical_size(),
        })
    })
    .await?;
    Ok(Json(response))
}

async fn flush_lsn(
    State(registry): State<AppState>,
    Path((tenant_id, timeline_id)): Path<(TenantId, TimelineId)>,
    Json(request): Json<FlushLsnRequest>,
) -> ApiResult<StatusCode> {
    let timeline = registry.get_timeline(tenant_id, timeline_id)?;
    timeline.advance_flush_lsn(request.lsn);
    Ok(StatusCode::OK)
}

async fn wait_lsn(
    State(registry): State<AppState>,
    Path((tenant_id, timeline_id)): Path<(TenantId, TimelineId)>,
    Query(params): Query<WaitParams>,
) -> ApiResult<StatusCode> {
    let timeline = registry.get_timeline(tenant_id, timeline_id)?;
    timeline
        .wait_for_last_record_lsn(params.lsn, Duration::from_millis(params.timeout_ms))
        .await?;
    Ok(StatusCode::OK)
}

async fn wait_for_upload(
    State(registry): State<AppState>,
    Path((tenant_id, timeline_id)): Path<(TenantId, TimelineId)>,
    Query(params): Query<WaitParams>,
) -> ApiResult<StatusCode> {
    let timeline = registry.get_timeline(tenant_id, timeline_id)?;
    timeline
        .wait_for_upload(params.lsn, Duration::from_millis(params.timeout_ms))
        .await?;
    Ok(StatusCode::OK)
}

async fn checkpoint(
    State(registry): State<AppState>,
    Path((tenant_id, timeline_id)): Path<(TenantId, TimelineId)>,
) -> ApiResult<StatusCode> {
    registry
        .execute(AdminCommand::Checkpoint { tenant_id, timeline_id })
        .await?;
    Ok(StatusCode::OK)
}

async fn compact(
    State(registry): State<AppState>,
    Path((tenant_id, timeline_id)): Path<(TenantId, TimelineId)>,
) -> ApiResult<StatusCode> {
    registry
        .execute(AdminCommand::Compact { tenant_id, timeline_id })
        .await?;
    Ok(StatusCode::OK)
}

async fn do_gc(
    State(registry): State<AppState>,
    Path((tenant_id, timeline_id)): Path<(TenantId, TimelineId)>,
    Query(params): Query<GcParams>,
) -> ApiResult<Json<CommandOutput>> {
    let output = registry
        .execute(AdminCommand::DoGc {
            tenant_id,
            timeline_id,
            pitr: Duration::from_secs(params.pitr_seconds),
        })
        .await?;
    Ok(Json(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use pagestore_core::remote::RemoteStorageConfig;
    use pagestore_core::storage::StorageConfig;
    use pagestore_core::Key;
    use serde::de::DeserializeOwned;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn registry(dir: &TempDir, remote: bool) -> Arc<TenantRegistry> {
        TenantRegistry::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            background_tasks: false,
            remote_storage: remote.then_some(RemoteStorageConfig::InMemory),
            ..StorageConfig::default()
        })
        .await
        .unwrap()
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, Vec<u8>) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn json<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_group_by_lsn() {
        let put = |lsn: u64, block: u32| IngestRecord {
            lsn: Lsn(lsn),
            delta: Delta::put(Key::new(1, 1, block), "v"),
        };
        let batches = group_by_lsn(vec![put(1, 0), put(1, 1), put(2, 0), put(1, 2)]);
        let shape: Vec<_> = batches.iter().map(|(lsn, d)| (lsn.0, d.len())).collect();
        assert_eq!(shape, vec![(1, 2), (2, 1), (1, 1)]);
    }

    #[tokio::test]
    async fn test_tenant_conf_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir, false).await;
        let app = create_router(registry.clone());

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/tenant",
            Some(serde_json::json!({"checkpoint_distance": 4096, "max_logical_size": 1000})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let tenant_id: TenantId = json(&body);
        let conf = registry.get_tenant(tenant_id).unwrap().conf().clone();
        assert_eq!(conf.checkpoint_distance, 4096);
        assert_eq!(conf.max_logical_size, Some(1000));

        let (status, _) = call(&app, Method::POST, "/v1/tenant", Some(serde_json::json!({"gc_period": "soon"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, Method::GET, "/v1/tenant", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json::<Vec<TenantId>>(&body), vec![tenant_id]);
    }

    #[tokio::test]
    async fn test_ingest_and_error_mapping() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir, false).await;
        let app = create_router(registry.clone());
        let tenant = registry
            .create_tenant(
                None,
                Some(TenantConf {
                    max_logical_size: Some(10),
                    ..TenantConf::default()
                }),
            )
            .unwrap();

        let (status, body) = call(&app, Method::POST, &format!("/v1/tenant/{}/timeline", tenant.id()), None).await;
        assert_eq!(status, StatusCode::CREATED);
        let detail: TimelineDetail = json(&body);
        let base = format!("/v1/tenant/{}/timeline/{}", tenant.id(), detail.timeline_id);

        let batch = serde_json::json!([
            {"lsn": "0/10", "delta": {"put": {"key": {"database": 1, "relation": 1, "block": 0}, "value": "abc"}}},
            {"lsn": "0/10", "delta": {"put": {"key": {"database": 1, "relation": 1, "block": 1}, "value": "de"}}},
        ]);
        let (status, body) = call(&app, Method::POST, &format!("{}/ingest", base), Some(batch.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let response: IngestResponse = json(&body);
        assert_eq!(response.last_record_lsn, Lsn(0x10));
        assert_eq!(response.current_logical_size, 5);

        // replaying the same LSN
        let (status, _) = call(&app, Method::POST, &format!("{}/ingest", base), Some(batch)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let too_big = serde_json::json!([
            {"lsn": "0/20", "delta": {"put": {"key": {"database": 1, "relation": 2, "block": 0}, "value": "0123456789"}}},
        ]);
        let (status, body) = call(&app, Method::POST, &format!("{}/ingest", base), Some(too_big)).await;
        assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
        assert!(json::<ErrorResponse>(&body).error.contains("Quota exceeded"));

        let reserved = serde_json::json!([
            {"lsn": "0/20", "delta": {"delete": {"key": {"database": 4294967295u32, "relation": 4294967295u32, "block": 4294967295u32}}}},
        ]);
        let (status, _) = call(&app, Method::POST, &format!("{}/ingest", base), Some(reserved)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::GET, &format!("{}/wait_lsn?lsn=0/20&timeout_ms=10", base), None).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        let (status, _) = call(&app, Method::GET, &format!("{}/wait_lsn?lsn=0/10&timeout_ms=10", base), None).await;
        assert_eq!(status, StatusCode::OK);

        // no remote storage configured
        let (status, _) = call(&app, Method::GET, &format!("{}/wait_for_upload?lsn=0/10&timeout_ms=10", base), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = format!("/v1/tenant/{}/timeline/{}", tenant.id(), TimelineId::generate());
        let (status, _) = call(&app, Method::GET, &missing, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_checkpoint_upload_and_metrics() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir, true).await;
        let app = create_router(registry.clone());
        let tenant = registry.create_tenant(None, None).unwrap();
        let timeline = registry.create_timeline(tenant.id(), CreateTimeline::default()).unwrap();
        let base = format!("/v1/tenant/{}/timeline/{}", tenant.id(), timeline.timeline_id());

        timeline.ingest(Lsn(0x40), &[Delta::put(Key::new(1, 1, 0), vec![1u8; 256])]).unwrap();
        let (status, _) = call(&app, Method::POST, &format!("{}/checkpoint", base), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::GET, &format!("{}/wait_for_upload?lsn=0/40", base), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, Method::GET, &format!("{}?include-non-incremental-logical-size=true", base), None).await;
        assert_eq!(status, StatusCode::OK);
        let detail: TimelineDetail = json(&body);
        assert_eq!(detail.remote_consistent_lsn, Some(Lsn(0x40)));
        assert_eq!(detail.current_physical_size_non_incremental, Some(detail.current_physical_size));

        let (status, body) = call(&app, Method::GET, &format!("/v1/tenant/{}", tenant.id()), None).await;
        assert_eq!(status, StatusCode::OK);
        let tenant_status: TenantStatus = json(&body);
        assert_eq!(tenant_status.current_physical_size, detail.current_physical_size);

        let (status, body) = call(&app, Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        let line = format!(
            "storage_current_physical_size{{tenant_id=\"{}\",timeline_id=\"{}\"}} {}",
            tenant.id(),
            timeline.timeline_id(),
            detail.current_physical_size
        );
        assert!(text.lines().any(|l| l == line), "missing {:?} in\n{}", line, text);
        assert!(text.contains(&format!("storage_remote_consistent_lsn{{tenant_id=\"{}\"", tenant.id())));
        let line = format!(
            "storage_remote_physical_size{{tenant_id=\"{}\",timeline_id=\"{}\"}} {}",
            tenant.id(),
            timeline.timeline_id(),
            detail.current_physical_size
        );
        assert!(text.lines().any(|l| l == line), "missing {:?} in\n{}", line, text);

        let (status, body) = call(&app, Method::POST, &format!("{}/do_gc?pitr_seconds=0", base), None).await;
        assert_eq!(status, StatusCode::OK);
        let gc: serde_json::Value = json(&body);
        assert_eq!(gc["images_created"], 1);

        let (status, _) = call(&app, Method::DELETE, &base, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::GET, &format!("/v1/tenant/{}", tenant.id()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        registry.shutdown().await;
    }
}
