//! HTTP API tests.
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`; lifecycle
//! endpoints launch `macemu-stub` in place of the emulator.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use macemu::context::SupervisorContext;
use macemu::paths::MacemuPaths;
use macemu::settings::Settings;
use macemu::web;
use serde_json::{Value, json};
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    _tmp: tempfile::TempDir,
    ctx: Arc<SupervisorContext>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let paths = MacemuPaths::under(tmp.path());
        paths.ensure().unwrap();

        let mut settings = Settings::default();
        settings.emulator.binary = PathBuf::from(env!("CARGO_BIN_EXE_macemu-stub"));
        settings.emulator.detect_display = false;
        settings.supervisor.launch_timeout_ms = 5_000;
        settings.supervisor.quit_timeout_ms = 3_000;
        settings.supervisor.command_timeout_ms = 2_000;
        settings.screenshot.converter = vec!["cat".to_string()];

        let ctx = Arc::new(SupervisorContext::new(paths, settings));
        Self { _tmp: tmp, ctx }
    }

    fn with_cdrom() -> Self {
        let fx = Self::new();
        std::fs::write(fx.ctx.paths.iso.join("macos_921_ppc.iso"), b"iso").unwrap();
        fx
    }

    fn app(&self) -> Router {
        web::router(Arc::clone(&self.ctx))
    }

    async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(self.app(), req).await
    }

    async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, body) = self.get(uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, body) = send(self.app(), req).await;
        (status, serde_json::from_slice(&body).unwrap())
    }
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

// ---------------------------------------------------------------------------
// Status and configuration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_without_instance() {
    let fx = Fixture::new();
    let (status, body) = fx.get_json("/api/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
    assert!(body["pid"].is_null());
    assert_eq!(body["config"]["memory_mb"], 512);
    assert_eq!(body["config"]["boot_device"], "cdrom");
}

#[tokio::test]
async fn config_update_is_validated_and_persisted() {
    let fx = Fixture::new();

    let (status, body) = fx.post("/api/config", json!({ "RAM_MB": "768" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["config"]["memory_mb"], 768);

    let (status, body) = fx
        .post("/api/config", json!({ "RAM_MB": "1024", "SCREEN_WIDTH": "0" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (_, body) = fx.get_json("/api/config").await;
    assert_eq!(body["config"]["memory_mb"], 768, "rejected edits leave the file alone");

    let saved = std::fs::read_to_string(fx.ctx.paths.config_file()).unwrap();
    assert!(saved.contains("RAM_MB=768"));
}

#[tokio::test]
async fn unknown_config_key_is_rejected() {
    let fx = Fixture::new();
    let (status, _) = fx.post("/api/config", json!({ "CPU_COUNT": "4" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_action_is_bad_request() {
    let fx = Fixture::new();
    let (status, body) = fx.post("/api/control/explode", json!({})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("explode"));
}

#[tokio::test]
async fn control_without_instance_conflicts() {
    let fx = Fixture::new();

    let (status, body) = fx.post("/api/control/pause", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, _) = fx.post("/api/control/stop", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn start_without_bootable_device_fails() {
    let fx = Fixture::new();
    let (status, body) = fx.post("/api/start", json!({})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("bootable"));
}

#[tokio::test]
async fn lifecycle_over_http() {
    let fx = Fixture::with_cdrom();

    let (status, body) = fx.post("/api/start", json!({})).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, _) = fx.post("/api/start", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, report) = fx.get_json("/api/status").await;
    assert_eq!(report["running"], true);
    assert_eq!(report["instance"]["state"], "running");
    let generation = report["instance"]["generation"].as_u64().unwrap();

    let (status, _) = fx.post("/api/control/pause", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, report) = fx.get_json("/api/status").await;
    assert_eq!(report["instance"]["state"], "paused");

    let stale = format!("/api/control/resume?generation={}", generation + 7);
    let (status, _) = fx.post(&stale, json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let pinned = format!("/api/control/resume?generation={generation}");
    let (status, _) = fx.post(&pinned, json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = fx.post("/api/control/stop", json!({})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (_, report) = fx.get_json("/api/status").await;
    assert_eq!(report["running"], false);
    assert_eq!(report["instance"]["state"], "stopped");

    fx.ctx.shutdown().await;
}

#[tokio::test]
async fn screenshot_round_trip() {
    let fx = Fixture::with_cdrom();

    let (status, _) = fx.get("/api/screenshot/latest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    fx.post("/api/start", json!({})).await;
    let (status, body) = fx.post("/api/screenshot", json!({})).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    // The `cat` converter passes the stub's PPM through unchanged.
    let (status, bytes) = fx.get("/api/screenshot/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert!(bytes.starts_with(b"P6"));

    fx.ctx.shutdown().await;
}

// ---------------------------------------------------------------------------
// Images and USB
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_listing_and_guarded_delete() {
    let fx = Fixture::with_cdrom();
    std::fs::write(fx.ctx.paths.disk.join("macos9.qcow2"), b"disk").unwrap();
    std::fs::write(fx.ctx.paths.disk.join("scratch.img"), b"scratch").unwrap();

    let (_, body) = fx.get_json("/api/disks").await;
    let names: Vec<_> = body["disks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["macos9.qcow2", "scratch.img"]);

    let (_, body) = fx.get_json("/api/isos").await;
    assert_eq!(body["isos"][0]["name"], "macos_921_ppc.iso");
    let (status, legacy) = fx.get_json("/api/iso").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(legacy, body);

    let (status, _) = fx
        .post("/api/disks/delete", json!({ "name": "macos9.qcow2" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = fx
        .post("/api/disks/delete", json!({ "name": "scratch.img" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!fx.ctx.paths.disk.join("scratch.img").exists());

    let (status, _) = fx
        .post("/api/disks/delete", json!({ "name": "scratch.img" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disk_create_requires_name() {
    let fx = Fixture::new();
    let (status, body) = fx.post("/api/disks/create", json!({ "size": "1G" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn usb_attach_validates_and_reaches_monitor() {
    let fx = Fixture::with_cdrom();

    let (status, _) = fx
        .post("/api/usb/attach", json!({ "vendor_id": "05ac" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let ids = json!({ "vendor_id": "05ac", "product_id": "12a8" });
    let (status, _) = fx.post("/api/usb/attach", ids.clone()).await;
    assert_eq!(status, StatusCode::CONFLICT, "no instance yet");

    fx.post("/api/start", json!({})).await;
    let (status, body) = fx.post("/api/usb/attach", ids.clone()).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (status, _) = fx.post("/api/usb/detach", ids).await;
    assert_eq!(status, StatusCode::OK);

    fx.ctx.shutdown().await;
}
