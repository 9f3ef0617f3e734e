//! HTTP API for the supervisor.
//!
//! ```text
//! GET  /api/status                 StatusReport
//! GET  /api/config                 saved configuration + warnings
//! POST /api/config                 {"RAM_MB": "768", ...}
//! POST /api/start | /api/restart
//! POST /api/control/{action}       stop | reset | pause | resume  (?generation=N)
//! POST /api/screenshot             GET /api/screenshot/latest
//! GET  /api/disks                  POST /api/disks/{create,delete,resize}
//! GET  /api/isos                   (also /api/iso)
//! GET  /api/usb                    POST /api/usb/{attach,detach}
//! ```
//!
//! Mutating endpoints answer `{"success": bool, "output"?: str, "error"?: str}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::context::{StartError, SupervisorContext};
use crate::vm::command::BuildError;
use crate::vm::config::{ConfigError, Configuration};
use crate::vm::images::ImageError;
use crate::vm::lifecycle::{LaunchError, TerminateError};
use crate::vm::monitor::{ChannelError, ControlCommand};
use crate::vm::status::StatusReport;
use crate::vm::usb;

/// Delay before retrying a command whose endpoint was unreachable.
const UNREACHABLE_RETRY_DELAY: Duration = Duration::from_millis(250);

type Ctx = State<Arc<SupervisorContext>>;

// ---------------------------------------------------------------------------
// Replies and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiReply {
    fn ok(output: impl Into<String>) -> Json<Self> {
        let output = output.into();
        Json(Self {
            success: true,
            output: (!output.is_empty()).then_some(output),
            error: None,
        })
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "api request failed");
        }
        let body = ApiReply {
            success: false,
            output: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ChannelError> for ApiError {
    fn from(e: ChannelError) -> Self {
        let status = match e {
            ChannelError::Unreachable(_) | ChannelError::Stale { .. } => StatusCode::CONFLICT,
            ChannelError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ChannelError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ChannelError::Io(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<StartError> for ApiError {
    fn from(e: StartError) -> Self {
        let status = match e {
            StartError::Build(BuildError::NoBootableDevice) => StatusCode::BAD_REQUEST,
            StartError::Launch(LaunchError::AlreadyRunning { .. }) => StatusCode::CONFLICT,
            StartError::Launch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<TerminateError> for ApiError {
    fn from(e: TerminateError) -> Self {
        let status = match e {
            TerminateError::NotRunning => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        let status = match e {
            ConfigError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ImageError> for ApiError {
    fn from(e: ImageError) -> Self {
        let status = match e {
            ImageError::NotFound(_) => StatusCode::NOT_FOUND,
            ImageError::Tool(_) | ImageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<ChannelError>() {
            Ok(channel) => channel.into(),
            Err(e) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(ctx: Arc<SupervisorContext>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/config", get(config_show).post(config_update))
        .route("/api/start", post(start))
        .route("/api/restart", post(restart))
        .route("/api/control/{action}", post(control))
        .route("/api/screenshot", post(screenshot))
        .route("/api/screenshot/latest", get(screenshot_latest))
        .route("/api/disks", get(disks_list))
        .route("/api/disks/create", post(disks_create))
        .route("/api/disks/delete", post(disks_delete))
        .route("/api/disks/resize", post(disks_resize))
        .route("/api/isos", get(isos_list))
        .route("/api/iso", get(isos_list))
        .route("/api/usb", get(usb_list))
        .route("/api/usb/attach", post(usb_attach))
        .route("/api/usb/detach", post(usb_detach))
        .with_state(ctx)
}

/// Serve the API on `bind` until Ctrl-C / SIGTERM, then shut the context
/// down (which stops the emulator).
pub async fn serve(ctx: Arc<SupervisorContext>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "web api listening");

    let result = axum::serve(listener, router(Arc::clone(&ctx)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("web server");

    ctx.shutdown().await;
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}

// ---------------------------------------------------------------------------
// Status and configuration
// ---------------------------------------------------------------------------

async fn status(State(ctx): Ctx) -> Json<StatusReport> {
    Json(ctx.status())
}

#[derive(Debug, Serialize)]
struct ConfigView {
    config: Configuration,
    warnings: Vec<String>,
    path: String,
}

async fn config_show(State(ctx): Ctx) -> Json<ConfigView> {
    let loaded = ctx.store.load();
    Json(ConfigView {
        config: loaded.config,
        warnings: loaded.warnings.iter().map(ToString::to_string).collect(),
        path: ctx.store.path().display().to_string(),
    })
}

/// Apply `KEY=value` edits (file keys, e.g. `RAM_MB`) all-or-nothing.
async fn config_update(
    State(ctx): Ctx,
    Json(edits): Json<BTreeMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut config = ctx.store.load().config;
    for (key, value) in &edits {
        config.set(key, value)?;
    }
    ctx.store.update(&config)?;
    info!(keys = ?edits.keys().collect::<Vec<_>>(), "configuration updated");

    let running = ctx.status().running;
    Ok(Json(json!({
        "success": true,
        "config": config,
        "restart_required": running,
    })))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

async fn start(State(ctx): Ctx) -> ApiResult<Json<ApiReply>> {
    let handle = ctx.start_instance().await?;
    Ok(ApiReply::ok(format!(
        "instance {} started (pid {})",
        handle.generation,
        handle.pid.map_or_else(|| "?".to_string(), |p| p.to_string())
    )))
}

async fn restart(State(ctx): Ctx) -> ApiResult<Json<ApiReply>> {
    let handle = ctx.restart_instance().await?;
    Ok(ApiReply::ok(format!("instance {} started", handle.generation)))
}

#[derive(Debug, Deserialize)]
struct ControlQuery {
    generation: Option<u64>,
}

async fn control(
    State(ctx): Ctx,
    Path(action): Path<String>,
    Query(query): Query<ControlQuery>,
) -> ApiResult<Json<ApiReply>> {
    let command = match action.as_str() {
        "stop" => {
            let handle = ctx.stop_instance().await?;
            return Ok(ApiReply::ok(format!(
                "instance {} {}",
                handle.generation, handle.state
            )));
        }
        "reset" => ControlCommand::Reset,
        "pause" => ControlCommand::Pause,
        "resume" => ControlCommand::Resume,
        other => return Err(ApiError::bad_request(format!("invalid action: {other}"))),
    };

    let output = dispatch_with_retry(&ctx, query.generation, command).await?;
    Ok(ApiReply::ok(output))
}

/// Dispatch, retrying once after a short delay when the endpoint is
/// unreachable (the instance may be between launch and readiness).
async fn dispatch_with_retry(
    ctx: &SupervisorContext,
    generation: Option<u64>,
    command: ControlCommand,
) -> Result<String, ChannelError> {
    match ctx.supervisor.dispatch(generation, command.clone()).await {
        Err(ChannelError::Unreachable(endpoint)) => {
            info!(endpoint = %endpoint.display(), command = command.name(), "endpoint unreachable, retrying once");
            tokio::time::sleep(UNREACHABLE_RETRY_DELAY).await;
            ctx.supervisor.dispatch(generation, command).await
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Screenshots
// ---------------------------------------------------------------------------

async fn screenshot(State(ctx): Ctx) -> ApiResult<Json<ApiReply>> {
    let shot = ctx.screenshots.capture(&ctx.supervisor).await?;
    Ok(ApiReply::ok(shot.path.display().to_string()))
}

async fn screenshot_latest(State(ctx): Ctx) -> ApiResult<Response> {
    let Some(path) = ctx.screenshots.latest() else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "no screenshot available"));
    };
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

// ---------------------------------------------------------------------------
// Disk and ISO images
// ---------------------------------------------------------------------------

async fn disks_list(State(ctx): Ctx) -> ApiResult<Json<serde_json::Value>> {
    let disks = ctx.images.list_disks().await?;
    Ok(Json(json!({ "disks": disks })))
}

async fn isos_list(State(ctx): Ctx) -> ApiResult<Json<serde_json::Value>> {
    let isos = ctx.images.list_isos()?;
    Ok(Json(json!({ "isos": isos })))
}

#[derive(Debug, Deserialize)]
struct DiskRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: Option<String>,
}

async fn disks_create(
    State(ctx): Ctx,
    Json(req): Json<DiskRequest>,
) -> ApiResult<Json<ApiReply>> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("disk name required"));
    }
    let size = req.size.as_deref().unwrap_or("10G").trim();
    let name = ctx.images.create_disk(&req.name, size).await?;
    Ok(ApiReply::ok(name))
}

async fn disks_delete(
    State(ctx): Ctx,
    Json(req): Json<DiskRequest>,
) -> ApiResult<Json<ApiReply>> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("disk name required"));
    }
    let config = ctx.store.load().config;
    ctx.images.delete_disk(name, &config)?;
    Ok(ApiReply::ok(""))
}

async fn disks_resize(
    State(ctx): Ctx,
    Json(req): Json<DiskRequest>,
) -> ApiResult<Json<ApiReply>> {
    let name = req.name.trim();
    let size = req.size.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() || size.is_empty() {
        return Err(ApiError::bad_request("disk name and size required"));
    }
    ctx.images.resize_disk(name, size).await?;
    Ok(ApiReply::ok(""))
}

// ---------------------------------------------------------------------------
// USB passthrough
// ---------------------------------------------------------------------------

async fn usb_list() -> Json<serde_json::Value> {
    Json(json!({ "devices": usb::list_devices().await }))
}

#[derive(Debug, Deserialize)]
struct UsbRequest {
    #[serde(default)]
    vendor_id: String,
    #[serde(default)]
    product_id: String,
}

impl UsbRequest {
    fn ids(&self) -> ApiResult<(String, String)> {
        let vendor = self.vendor_id.trim().to_ascii_lowercase();
        let product = self.product_id.trim().to_ascii_lowercase();
        if vendor.is_empty() || product.is_empty() {
            return Err(ApiError::bad_request("vendor and product id required"));
        }
        Ok((vendor, product))
    }
}

async fn usb_attach(State(ctx): Ctx, Json(req): Json<UsbRequest>) -> ApiResult<Json<ApiReply>> {
    let (vendor_id, product_id) = req.ids()?;
    let command = ControlCommand::UsbAttach {
        vendor_id,
        product_id,
    };
    Ok(ApiReply::ok(dispatch_with_retry(&ctx, None, command).await?))
}

async fn usb_detach(State(ctx): Ctx, Json(req): Json<UsbRequest>) -> ApiResult<Json<ApiReply>> {
    let (vendor_id, product_id) = req.ids()?;
    let command = ControlCommand::UsbDetach {
        vendor_id,
        product_id,
    };
    Ok(ApiReply::ok(dispatch_with_retry(&ctx, None, command).await?))
}
