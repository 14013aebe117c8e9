//! End-to-end HTTP surface tests run against a real `axum::serve` listener
//! bound to an ephemeral port, exercising the router the way a client
//! actually would rather than calling handlers directly.

use std::path::PathBuf;
use std::sync::Arc;

use acore_sandbox::api::{self, AppState};
use acore_sandbox::config::Config;
use acore_sandbox::credentials::StaticCredentialProvider;
use acore_sandbox::queue::{JobQueue, JobQueueLayout};
use acore_sandbox::sandbox::launcher::{LauncherConfig, SandboxLauncher};
use acore_sandbox::sandbox::slots::SlotAllocator;
use acore_sandbox::service::Service;
use acore_sandbox::worker_pool::WorkerPool;
use tokio::net::TcpListener;

/// Spins up the full service against a scratch directory tree, with a
/// deliberately nonexistent rootfs image so any submitted job fails fast
/// (phase 1 of the launcher) instead of trying to run real Firecracker.
/// Returns the bound address and a guard that keeps the tempdir alive.
async fn spawn_test_server() -> (String, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();

    let archive_root = tmp.path().join("submissions");
    tokio::fs::create_dir_all(&archive_root).await.unwrap();

    let layout = JobQueueLayout {
        log_dir: tmp.path().join("logs"),
        archive_root: archive_root.clone(),
    };
    let queue = JobQueue::new(16, layout);

    let launcher_config = LauncherConfig {
        workspace_root: tmp.path().join("workspaces"),
        firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
        jailer_bin: PathBuf::from("/usr/local/bin/jailer"),
        kernel_image: tmp.path().join("vmlinux"),
        rootfs_base_image: tmp.path().join("does-not-exist.ext4"),
        chroot_base: tmp.path().join("jailer"),
        guest_ssh_key: tmp.path().join("guest_ssh_key"),
    };
    let launcher = Arc::new(SandboxLauncher::new(launcher_config, Arc::new(SlotAllocator::new(0, 10_000))));
    let credentials = Arc::new(StaticCredentialProvider::new("test-token".into()));
    let pool = Arc::new(WorkerPool::new(1, launcher, credentials.clone()));

    let service = Service::new(queue, pool, credentials);
    service.spawn_dispatch_loop();

    let config = Config::from_raw_values(
        Some("0"),
        None,
        None,
        None,
        Some(archive_root.to_str().unwrap()),
        None,
        None,
        None,
        None,
        None,
        None,
        None,
        None,
    );

    let state = AppState {
        service,
        config: Arc::new(config),
        archive_root: Some(archive_root),
    };

    let app = api::create_app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), tmp)
}

#[tokio::test]
async fn health_reports_worker_and_queue_counts() {
    let (base, _tmp) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["sandbox_workers"], 1);
    assert_eq!(body["token_ready"], true);
}

/// Pins DESIGN.md's Open Question 1: `/validate/active` must resolve to the
/// literal-route handler (an `{"active": [...]}` body), never be captured by
/// `/validate/{job_id}`'s handler (which would 404 on "active" as an unknown
/// job id).
#[tokio::test]
async fn active_route_not_shadowed_by_dynamic_job_id_route() {
    let (base, _tmp) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/validate/active")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body.get("active").is_some(), "expected an `active` array, got {body}");
    assert!(body.get("job_id").is_none(), "active route must not be shadowed by the job_id route");
}

#[tokio::test]
async fn unknown_job_id_returns_404() {
    let (base, _tmp) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/validate/no-such-job")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn submit_rejects_non_zip_workspace_path() {
    let (base, _tmp) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/validate"))
        .json(&serde_json::json!({
            "workspace_zip_path": "/tmp/not-a-zip.tar",
            "task_json": {"task_id": "t1"},
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn submit_runs_job_to_failure_when_rootfs_image_is_missing() {
    let (base, tmp) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let zip_path = tmp.path().join("submissions").join("workspace.zip");
    tokio::fs::write(&zip_path, b"PK\x05\x06\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0").await.unwrap();

    let resp = client
        .post(format!("{base}/validate"))
        .json(&serde_json::json!({
            "workspace_zip_path": zip_path.to_str().unwrap(),
            "task_json": {"task_id": "t1"},
            "timeout_s": 5,
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["status"], "fail");
}

#[tokio::test]
async fn submit_rejects_path_outside_archive_root() {
    let (base, _tmp) = spawn_test_server().await;
    let client = reqwest::Client::new();

    let other = tempfile::tempdir().unwrap();
    let zip_path = other.path().join("outside.zip");
    tokio::fs::write(&zip_path, b"PK\x05\x06\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0").await.unwrap();

    let resp = client
        .post(format!("{base}/validate"))
        .json(&serde_json::json!({
            "workspace_zip_path": zip_path.to_str().unwrap(),
            "task_json": {"task_id": "t1"},
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 403);
}
