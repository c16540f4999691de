//! HTTP API handlers for the ModelDepot web UI.
//!
//! A thin adapter: each route translates 1:1 to an engine call and maps
//! engine errors onto status codes. All endpoints are mounted under
//! `/api/*` by the main HTTP server; live progress goes over `/ws`.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

use crate::dedupe::{self, Selection};
use crate::engine::Engine;
use crate::error::Error;
use crate::mirror::{self, MirrorPlan};
use crate::paths::RelPath;
use crate::queue::TaskPayload;
use crate::sources::relpath_key;
use crate::types::Side;

/// Axum application state: the engine handle plus process start time.
#[derive(Clone)]
pub struct AppContext {
    pub engine: Arc<Engine>,
    pub start_time: Instant,
}

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult<T> = Result<T, ApiError>;

/// Map engine errors onto HTTP status codes; the message is surfaced
/// verbatim.
fn error_response(e: Error) -> ApiError {
    let status = match &e {
        Error::PathEscape(_) | Error::Invalid(_) => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::ConflictRefused(_) => StatusCode::CONFLICT,
        Error::PolicyDenied(_) | Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    error_response(Error::Invalid(msg.into()))
}

fn parse_relpath(raw: &str) -> ApiResult<RelPath> {
    RelPath::new(raw).map_err(error_response)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Server status, version, uptime, and per-side counts.
pub async fn api_health(State(ctx): State<AppContext>) -> impl IntoResponse {
    let local = ctx.engine.index.stats(Side::Local);
    let lake = ctx.engine.index.stats(Side::Lake);
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
        "local_files": local.file_count,
        "lake_files": lake.file_count,
    }))
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshSide {
    Local,
    Lake,
    Both,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    side: RefreshSide,
}

/// Kick off a background re-scan; completion arrives as `index_refreshed`.
pub async fn api_index_refresh(
    State(ctx): State<AppContext>,
    Json(body): Json<RefreshRequest>,
) -> impl IntoResponse {
    let sides: &[Side] = match body.side {
        RefreshSide::Local => &[Side::Local],
        RefreshSide::Lake => &[Side::Lake],
        RefreshSide::Both => &Side::ALL,
    };
    for side in sides {
        let _ = ctx.engine.refresh_index(*side);
    }
    StatusCode::ACCEPTED
}

/// Full diff of the two sides.
pub async fn api_index_diff(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.engine.diff())
}

pub async fn api_index_stats(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "local": ctx.engine.index.stats(Side::Local),
        "lake": ctx.engine.index.stats(Side::Lake),
    }))
}

pub async fn api_index_config(State(ctx): State<AppContext>) -> impl IntoResponse {
    let config = &ctx.engine.config;
    Json(serde_json::json!({
        "local_root": config.local.root,
        "lake_root": config.lake.root,
        "local_allow_delete": config.local.allow_delete_from_sync,
        "lake_allow_delete": config.lake.allow_delete_from_sync,
        "queue_concurrency": config.queue_concurrency,
        "queue_retry_count": config.queue_retry_count,
        "hash_workers": config.hash_workers,
    }))
}

// ---------------------------------------------------------------------------
// Source URLs
// ---------------------------------------------------------------------------

pub async fn api_sources_list(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(serde_json::json!({ "sources": ctx.engine.sources.list() }))
}

#[derive(Deserialize)]
pub struct SourcePutRequest {
    url: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    filename_hint: Option<String>,
}

pub async fn api_sources_put_hash(
    State(ctx): State<AppContext>,
    Path(hash): Path<String>,
    Json(body): Json<SourcePutRequest>,
) -> ApiResult<impl IntoResponse> {
    let entry = ctx
        .engine
        .sources
        .put(&hash, &body.url, body.notes, body.filename_hint)
        .map_err(error_response)?;
    Ok(Json(entry))
}

pub async fn api_sources_delete_hash(
    State(ctx): State<AppContext>,
    Path(hash): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = ctx.engine.sources.delete(&hash).map_err(error_response)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

#[derive(Deserialize)]
pub struct SourcePutByRelpathRequest {
    url: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    filename_hint: Option<String>,
    /// Also enqueue hash work so the entry can move onto its hash key.
    #[serde(default)]
    queue_hash: bool,
}

pub async fn api_sources_put_relpath(
    State(ctx): State<AppContext>,
    Path(relpath): Path<String>,
    Json(body): Json<SourcePutByRelpathRequest>,
) -> ApiResult<impl IntoResponse> {
    let relpath = parse_relpath(&relpath)?;
    let entry = ctx
        .engine
        .sources
        .put(&relpath_key(&relpath), &body.url, body.notes, body.filename_hint)
        .map_err(error_response)?;

    let task_id = if body.queue_hash {
        let side = if ctx.engine.index.get(Side::Local, &relpath).is_some() {
            Side::Local
        } else {
            Side::Lake
        };
        let task = ctx
            .engine
            .queue
            .enqueue(TaskPayload::HashFile { side, relpath })
            .map_err(error_response)?;
        Some(task.id)
    } else {
        None
    };
    Ok(Json(serde_json::json!({ "source": entry, "task_id": task_id })))
}

pub async fn api_sources_delete_relpath(
    State(ctx): State<AppContext>,
    Path(relpath): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let relpath = parse_relpath(&relpath)?;
    let removed = ctx.engine.sources.delete(&relpath_key(&relpath)).map_err(error_response)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

// ---------------------------------------------------------------------------
// Hash and verify
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct HashFileQuery {
    relpath: String,
    #[serde(default)]
    side: Option<Side>,
}

/// Enqueue hashing of a single file.
pub async fn api_hash_file(
    State(ctx): State<AppContext>,
    Query(q): Query<HashFileQuery>,
) -> ApiResult<impl IntoResponse> {
    let relpath = parse_relpath(&q.relpath)?;
    let side = q.side.unwrap_or(Side::Local);
    let task = ctx
        .engine
        .queue
        .enqueue(TaskPayload::HashFile { side, relpath })
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({ "task_id": task.id })))
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    side: Option<Side>,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    relpath: Option<String>,
}

/// Enqueue a verify pass over a file, a folder, or whole sides.
pub async fn api_verify(
    State(ctx): State<AppContext>,
    Json(body): Json<VerifyRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.folder.is_some() && body.relpath.is_some() {
        return Err(bad_request("give folder or relpath, not both"));
    }
    let folder = body.folder.as_deref().map(parse_relpath).transpose()?;
    let relpath = body.relpath.as_deref().map(parse_relpath).transpose()?;
    let task = ctx
        .engine
        .queue
        .enqueue(TaskPayload::Verify { side: body.side, folder, relpath })
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({ "task_id": task.id })))
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CopyRequest {
    src_side: Side,
    src_relpath: String,
    dst_side: Side,
    /// Optional rename; defaults to the source relpath.
    #[serde(default)]
    dst_relpath: Option<String>,
}

pub async fn api_queue_copy(
    State(ctx): State<AppContext>,
    Json(body): Json<CopyRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.src_side == body.dst_side {
        return Err(bad_request("src_side and dst_side must differ"));
    }
    let src_relpath = parse_relpath(&body.src_relpath)?;
    let dst_relpath = match body.dst_relpath.as_deref() {
        Some(raw) => parse_relpath(raw)?,
        None => src_relpath.clone(),
    };
    let task = ctx
        .engine
        .queue
        .enqueue(TaskPayload::Copy {
            src_side: body.src_side,
            src_relpath,
            dst_side: body.dst_side,
            dst_relpath,
        })
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({ "task_id": task.id })))
}

#[derive(Deserialize)]
pub struct DeleteRequest {
    side: Side,
    relpath: String,
}

/// Sync-path delete; refused up front when the side's policy forbids it.
pub async fn api_queue_delete(
    State(ctx): State<AppContext>,
    Json(body): Json<DeleteRequest>,
) -> ApiResult<impl IntoResponse> {
    if !ctx.engine.config.allow_delete_from_sync(body.side) {
        return Err(error_response(Error::PolicyDenied(body.side)));
    }
    let relpath = parse_relpath(&body.relpath)?;
    let task = ctx
        .engine
        .queue
        .enqueue(TaskPayload::Delete { side: body.side, relpath, from_dedupe: false })
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({ "task_id": task.id })))
}

pub async fn api_queue_tasks(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.engine.queue.list())
}

pub async fn api_queue_task(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    match ctx.engine.queue.get(&id) {
        Some(task) => Ok(Json(task)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no task {id}") })),
        )),
    }
}

pub async fn api_queue_pause(State(ctx): State<AppContext>) -> impl IntoResponse {
    ctx.engine.queue.pause();
    Json(serde_json::json!({ "paused": true }))
}

pub async fn api_queue_resume(State(ctx): State<AppContext>) -> impl IntoResponse {
    ctx.engine.queue.resume();
    Json(serde_json::json!({ "paused": false }))
}

pub async fn api_queue_cancel(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    match ctx.engine.queue.cancel(&id) {
        Some(task) => Ok(Json(task)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no task {id}") })),
        )),
    }
}

pub async fn api_queue_cancel_all(State(ctx): State<AppContext>) -> impl IntoResponse {
    let cancelled = ctx.engine.queue.cancel_all();
    Json(serde_json::json!({ "cancelled": cancelled }))
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MirrorPlanRequest {
    src_side: Side,
    #[serde(default)]
    src_folder: Option<String>,
    dst_side: Side,
    #[serde(default)]
    dst_folder: Option<String>,
}

pub async fn api_mirror_plan(
    State(ctx): State<AppContext>,
    Json(body): Json<MirrorPlanRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.src_side == body.dst_side {
        return Err(bad_request("src_side and dst_side must differ"));
    }
    let src_folder = body.src_folder.as_deref().map(parse_relpath).transpose()?;
    let dst_folder = match body.dst_folder.as_deref() {
        Some(raw) => Some(parse_relpath(raw)?),
        None => src_folder.clone(),
    };
    Ok(Json(ctx.engine.mirror_plan(
        body.src_side,
        src_folder.as_ref(),
        body.dst_side,
        dst_folder.as_ref(),
    )))
}

#[derive(Deserialize)]
pub struct MirrorExecuteRequest {
    plan: MirrorPlan,
}

pub async fn api_mirror_execute(
    State(ctx): State<AppContext>,
    Json(body): Json<MirrorExecuteRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.plan.src_side == body.plan.dst_side {
        return Err(bad_request("plan sides must differ"));
    }
    let task_ids = mirror::execute(&ctx.engine, &body.plan).map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "enqueued": task_ids.len(),
        "task_ids": task_ids,
        "skipped_conflicts": body.plan.conflicts.len(),
    })))
}

// ---------------------------------------------------------------------------
// Dedupe
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct DedupeScanRequest {
    side: Side,
    mode: dedupe::DedupeMode,
    #[serde(default)]
    min_size_bytes: u64,
}

pub async fn api_dedupe_scan(
    State(ctx): State<AppContext>,
    Json(body): Json<DedupeScanRequest>,
) -> ApiResult<impl IntoResponse> {
    let task = ctx
        .engine
        .queue
        .enqueue(TaskPayload::DedupeScan {
            side: body.side,
            mode: body.mode,
            min_size_bytes: body.min_size_bytes,
        })
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({ "task_id": task.id })))
}

pub async fn api_dedupe_scan_status(State(ctx): State<AppContext>) -> ApiResult<impl IntoResponse> {
    let scans = ctx.engine.dedupe.list_scans(20).map_err(error_response)?;
    Ok(Json(serde_json::json!({ "scans": scans })))
}

pub async fn api_dedupe_scan_latest(State(ctx): State<AppContext>) -> ApiResult<impl IntoResponse> {
    let latest = ctx.engine.dedupe.latest_scan().map_err(error_response)?;
    Ok(Json(serde_json::json!({ "scan": latest })))
}

pub async fn api_dedupe_scan_delete(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = ctx.engine.dedupe.delete_scan(&id).map_err(error_response)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

pub async fn api_dedupe_results(
    State(ctx): State<AppContext>,
    Path(scan_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if ctx.engine.dedupe.get_scan(&scan_id).map_err(error_response)?.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no scan {scan_id}") })),
        ));
    }
    let groups = ctx.engine.dedupe.groups(&scan_id).map_err(error_response)?;
    Ok(Json(groups))
}

#[derive(Deserialize)]
pub struct DedupeExecuteRequest {
    scan_id: String,
    selections: Vec<Selection>,
}

pub async fn api_dedupe_execute(
    State(ctx): State<AppContext>,
    Json(body): Json<DedupeExecuteRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = dedupe::execute(&ctx.engine, &body.scan_id, &body.selections)
        .map_err(error_response)?;
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Bundles
// ---------------------------------------------------------------------------

pub async fn api_bundles_list(State(ctx): State<AppContext>) -> ApiResult<impl IntoResponse> {
    let names = ctx.engine.bundles.list().map_err(error_response)?;
    Ok(Json(serde_json::json!({ "bundles": names })))
}

pub async fn api_bundles_get(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    match ctx.engine.bundles.get(&name).map_err(error_response)? {
        Some(bundle) => Ok(Json(bundle)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no bundle {name}") })),
        )),
    }
}

#[derive(Deserialize)]
pub struct BundlePutRequest {
    entries: Vec<crate::bundle::BundleEntry>,
}

pub async fn api_bundles_put(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
    Json(body): Json<BundlePutRequest>,
) -> ApiResult<impl IntoResponse> {
    let bundle = crate::bundle::Bundle { name, entries: body.entries };
    ctx.engine.bundles.put(&bundle).map_err(error_response)?;
    Ok(Json(bundle))
}

pub async fn api_bundles_delete(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = ctx.engine.bundles.delete(&name).map_err(error_response)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}
