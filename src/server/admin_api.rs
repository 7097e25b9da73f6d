//! Admin HTTP API.
//!
//! - GET /health
//! - GET /v1/stats, GET /metrics
//! - GET/POST /v1/device
//! - GET/PUT/DELETE /v1/pages/{index}, GET /v1/pages/{index}/slot
//! - POST /v1/discard
//! - POST /v1/writeback, POST /v1/idle
//! - GET/PUT /v1/limits
//! - POST /v1/reset

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::device::{
    DeviceInfo, LimitsSnapshot, SlotReport, WritebackMode, WritebackSummary, Zram, ZramError,
};
use crate::stats::StatsSnapshot;
use crate::PAGE_SIZE;

/// Application state shared across handlers.
pub struct AppState {
    pub zram: Arc<Zram>,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/stats", get(stats))
        .route("/metrics", get(metrics))
        .route("/v1/device", get(device_info).post(configure_device))
        .route(
            "/v1/pages/{index}",
            get(read_page).put(write_page).delete(free_page),
        )
        .route("/v1/pages/{index}/slot", get(slot_report))
        .route("/v1/discard", post(discard))
        .route("/v1/writeback", post(writeback))
        .route("/v1/idle", post(mark_idle))
        .route("/v1/limits", get(limits).put(set_limits))
        .route("/v1/reset", post(reset))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// A device error rendered as a JSON body with a matching status code.
pub struct ApiError(ZramError);

impl From<ZramError> for ApiError {
    fn from(e: ZramError) -> Self {
        ApiError(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ZramError::InvalidIo(_) | ZramError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            ZramError::ConfigurationConflict(_) | ZramError::NoBackingStore => StatusCode::CONFLICT,
            ZramError::OverLimit { .. } | ZramError::AllocationFailure(_) => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            ZramError::WritebackIoFailure(_)
            | ZramError::PrefetchIoFailure { .. }
            | ZramError::Backing(_) => StatusCode::BAD_GATEWAY,
            ZramError::Compression(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ─── Request/Response Types ────────────────────────────────────────────────

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub initialized: bool,
}

/// Device configuration request. Fields left out are not changed.
#[derive(Debug, Default, Deserialize)]
pub struct DeviceRequest {
    #[serde(default)]
    pub compressor: Option<String>,
    #[serde(default)]
    pub disksize: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub len: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FreeResponse {
    pub index: u32,
    pub freed: bool,
}

#[derive(Debug, Deserialize)]
pub struct DiscardRequest {
    pub pos: u64,
    pub len: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiscardResponse {
    pub pages: u64,
}

/// Manual writeback request. `mode` is one of `idle`, `huge`, `huge_idle`,
/// `all` or `index=N`.
#[derive(Debug, Deserialize)]
pub struct WritebackRequest {
    pub mode: String,
    /// Queue to the writeback worker instead of waiting.
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WritebackResponse {
    Done(WritebackSummary),
    Queued { job_id: String, queued: usize },
}

#[derive(Debug, Default, Deserialize)]
pub struct IdleRequest {
    /// Only mark slots untouched for at least this many seconds.
    #[serde(default)]
    pub cutoff_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdleResponse {
    pub marked: usize,
}

/// Limit update. Fields left out are not changed.
#[derive(Debug, Default, Deserialize)]
pub struct LimitsRequest {
    #[serde(default)]
    pub mem_limit: Option<u64>,
    #[serde(default)]
    pub lru_limit: Option<u64>,
    #[serde(default)]
    pub wb_limit: Option<u64>,
    /// Lift the writeback limit.
    #[serde(default)]
    pub clear_wb_limit: bool,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        initialized: state.zram.is_initialized().await,
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.zram.stats())
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, StatusCode> {
    let body = state.zram.stats().to_prometheus().map_err(|e| {
        warn!(error = %e, "Metrics encoding failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn device_info(State(state): State<Arc<AppState>>) -> Json<DeviceInfo> {
    Json(state.zram.info().await)
}

async fn configure_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<Json<DeviceInfo>> {
    if let Some(name) = &req.compressor {
        state.zram.set_compressor(name).await?;
    }
    if let Some(bytes) = req.disksize {
        state.zram.set_disksize(bytes).await?;
    }
    Ok(Json(state.zram.info().await))
}

async fn read_page(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let len = query
        .len
        .unwrap_or(PAGE_SIZE - query.offset.min(PAGE_SIZE))
        .min(PAGE_SIZE);
    let mut buf = vec![0u8; len];
    state.zram.read(index, query.offset, &mut buf).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], buf))
}

async fn write_page(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
    Query(query): Query<PageQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state.zram.write(index, query.offset, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn free_page(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
) -> ApiResult<Json<FreeResponse>> {
    let freed = state.zram.notify_free(index).await?;
    Ok(Json(FreeResponse { index, freed }))
}

async fn slot_report(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
) -> ApiResult<Json<SlotReport>> {
    let slot = state.zram.slot(index).await?;
    Ok(Json(SlotReport::new(index, slot)))
}

async fn discard(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DiscardRequest>,
) -> ApiResult<Json<DiscardResponse>> {
    let pages = state.zram.discard(req.pos, req.len).await?;
    Ok(Json(DiscardResponse { pages }))
}

async fn writeback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<WritebackRequest>,
) -> ApiResult<Json<WritebackResponse>> {
    let mode: WritebackMode = req.mode.parse().map_err(ZramError::InvalidConfig)?;

    if req.background {
        let job_id = Uuid::new_v4().to_string();
        let queued = state.zram.trigger_writeback(mode).await?;
        info!(job_id = job_id, mode = %mode, queued, "Writeback queued");
        return Ok(Json(WritebackResponse::Queued { job_id, queued }));
    }

    let summary = state.zram.writeback(mode).await?;
    Ok(Json(WritebackResponse::Done(summary)))
}

async fn mark_idle(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IdleRequest>,
) -> ApiResult<Json<IdleResponse>> {
    let cutoff = req.cutoff_secs.map(Duration::from_secs);
    let marked = state.zram.mark_idle(cutoff).await?;
    Ok(Json(IdleResponse { marked }))
}

async fn limits(State(state): State<Arc<AppState>>) -> Json<LimitsSnapshot> {
    Json(state.zram.limits())
}

async fn set_limits(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LimitsRequest>,
) -> Json<LimitsSnapshot> {
    if let Some(bytes) = req.mem_limit {
        state.zram.set_mem_limit(bytes);
    }
    if let Some(bytes) = req.lru_limit {
        state.zram.set_lru_limit(bytes);
    }
    if req.clear_wb_limit {
        state.zram.set_wb_limit(None);
    } else if let Some(bytes) = req.wb_limit {
        state.zram.set_wb_limit(Some(bytes));
    }
    Json(state.zram.limits())
}

async fn reset(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    state.zram.reset().await?;
    Ok(StatusCode::NO_CONTENT)
}
