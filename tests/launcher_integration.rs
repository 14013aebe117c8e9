//! Exercises the launcher's rootfs/workspace-injection phase (phases 1-3)
//! without requiring real Firecracker/KVM hardware. The jailer-spawn and
//! guest-wait phases need an actual hypervisor and are intentionally left
//! to manual/hardware-backed testing, matching spec §8's scope for this
//! harness.

use std::io::Write;

use acore_sandbox::sandbox::rootfs::prepare;
use acore_sandbox::sandbox::types::SandboxSpec;

fn sample_spec(job_id: &str) -> SandboxSpec {
    SandboxSpec {
        job_id: job_id.to_string(),
        task_id: "task-1".into(),
        miner_uid: Some("miner-1".into()),
        workspace_zip: None,
        workspace_dir: None,
        task_json: serde_json::json!({"task_id": "task-1", "checks": ["net"]}),
        timeout_s: 60,
        net_checks: true,
        quiet_kernel: true,
    }
}

#[tokio::test]
async fn prepare_injects_workspace_directory_and_task_json() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = tmp.path().join("rootfs.ext4");
    tokio::fs::write(&rootfs, b"fake rootfs bytes").await.unwrap();

    let workspace_src = tmp.path().join("src-workspace");
    tokio::fs::create_dir_all(workspace_src.join("modules")).await.unwrap();
    tokio::fs::write(workspace_src.join("main.tf"), b"resource \"x\" {}").await.unwrap();
    tokio::fs::write(workspace_src.join("modules").join("net.tf"), b"resource \"y\" {}").await.unwrap();

    let mut spec = sample_spec("job-dir");
    spec.workspace_dir = Some(workspace_src.clone());

    let workspace = prepare(tmp.path(), &rootfs, &spec).await.unwrap();

    assert!(workspace.rootfs_path.exists());
    assert!(workspace.workdir.join("main.tf").exists());
    assert!(workspace.workdir.join("modules").join("net.tf").exists());
    assert!(workspace.results_dir.is_dir());

    let task_json: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(&workspace.task_json_path).await.unwrap()).unwrap();
    assert_eq!(task_json["task_id"], "task-1");
}

fn write_zip(path: &std::path::Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap();
}

#[tokio::test]
async fn prepare_extracts_workspace_zip_into_workdir() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = tmp.path().join("rootfs.ext4");
    tokio::fs::write(&rootfs, b"fake rootfs bytes").await.unwrap();

    let zip_path = tmp.path().join("workspace.zip");
    write_zip(
        &zip_path,
        &[
            ("main.tf", b"resource \"x\" {}" as &[u8]),
            ("modules/net.tf", b"resource \"y\" {}"),
        ],
    );

    let mut spec = sample_spec("job-zip");
    spec.workspace_zip = Some(zip_path);

    let workspace = prepare(tmp.path(), &rootfs, &spec).await.unwrap();

    assert!(workspace.workdir.join("main.tf").exists());
    assert!(workspace.workdir.join("modules").join("net.tf").exists());
}

#[tokio::test]
async fn prepare_rejects_zip_entry_that_escapes_workdir() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = tmp.path().join("rootfs.ext4");
    tokio::fs::write(&rootfs, b"fake rootfs bytes").await.unwrap();

    let zip_path = tmp.path().join("evil.zip");
    write_zip(&zip_path, &[("../../etc/passwd", b"pwned" as &[u8])]);

    let mut spec = sample_spec("job-evil-zip");
    spec.workspace_zip = Some(zip_path);

    let result = prepare(tmp.path(), &rootfs, &spec).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn prepare_fails_when_rootfs_base_image_is_missing() {
    let tmp = tempfile::tempdir().unwrap();
    let missing_rootfs = tmp.path().join("no-such-image.ext4");

    let mut spec = sample_spec("job-missing-rootfs");
    spec.workspace_dir = Some(tmp.path().to_path_buf());

    let result = prepare(tmp.path(), &missing_rootfs, &spec).await;
    assert!(result.is_err());
}
