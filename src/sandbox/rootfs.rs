//! Scratch directory setup, rootfs cloning, and workspace staging —
//! launcher phases 1-3.
//!
//! `workdir`/`results_dir` are host-side staging directories, not the
//! guest's own filesystem: the rootfs image is cloned untouched and the
//! guest never sees the host path directly. Phase 5/6 (`launcher::drive_vm`)
//! pushes `workdir`'s contents into the booted guest over the SSH channel
//! (`guest_agent::GuestAgent::put_dir`) and pulls `results_dir`'s contents
//! back the same way once the guest runner exits.

use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};
use crate::sandbox::types::SandboxSpec;

/// Per-job scratch directory and the paths carved out of it.
pub struct JobWorkspace {
    pub scratch_dir: PathBuf,
    pub rootfs_path: PathBuf,
    /// Host-side staging copy of the submitted workspace; pushed into the
    /// guest's `/workspace` over SSH before the guest runner starts.
    pub workdir: PathBuf,
    /// Host-side landing spot for the guest's result artifact, pulled back
    /// from the guest's `/run/results` over SSH after it halts.
    pub results_dir: PathBuf,
    pub task_json_path: PathBuf,
}

/// Phase 1-3: create the per-job scratch directory, clone the base rootfs
/// image into it, and stage the workspace bundle (zip or directory) plus
/// the task manifest on the host side, ready to be pushed into the guest
/// once it boots.
pub async fn prepare(
    workspace_root: &Path,
    rootfs_base_image: &Path,
    spec: &SandboxSpec,
) -> Result<JobWorkspace> {
    let scratch_dir = workspace_root.join(format!("job-{}", spec.job_id));
    tokio::fs::create_dir_all(&scratch_dir).await?;

    let rootfs_path = scratch_dir.join("rootfs.ext4");
    tracing::debug!(
        src = %rootfs_base_image.display(),
        dst = %rootfs_path.display(),
        "cloning rootfs"
    );
    tokio::fs::copy(rootfs_base_image, &rootfs_path)
        .await
        .map_err(|err| {
            SandboxError::Internal(format!(
                "failed to clone rootfs from {}: {err}",
                rootfs_base_image.display()
            ))
        })?;

    let workdir = scratch_dir.join("workspace");
    tokio::fs::create_dir_all(&workdir).await?;

    if let Some(zip_path) = &spec.workspace_zip {
        extract_workspace_zip(zip_path, &workdir)?;
    } else if let Some(dir_path) = &spec.workspace_dir {
        copy_dir_recursive(dir_path, &workdir).await?;
    } else {
        return Err(SandboxError::BadRequest(
            "job requires workspace_zip or workspace_dir".into(),
        ));
    }

    let results_dir = scratch_dir.join("results");
    tokio::fs::create_dir_all(&results_dir).await?;

    let task_json_path = workdir.join("task.json");
    tokio::fs::write(&task_json_path, serde_json::to_vec(&spec.task_json)?).await?;

    Ok(JobWorkspace {
        scratch_dir,
        rootfs_path,
        workdir,
        results_dir,
        task_json_path,
    })
}

fn extract_workspace_zip(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| SandboxError::BadRequest(format!("invalid workspace archive: {err}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SandboxError::BadRequest(format!("invalid workspace archive entry: {err}")))?;
        let out_path = safe_join(dest, entry.name())?;

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out_file)?;
    }
    Ok(())
}

/// Joins `name` onto `root`, rejecting any path component that would escape
/// `root` (`..`, absolute paths smuggled into a zip entry).
fn safe_join(root: &Path, name: &str) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(name).components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::CurDir => {}
            _ => {
                return Err(SandboxError::Forbidden(format!(
                    "workspace archive entry escapes extraction root: {name}"
                )));
            }
        }
    }
    Ok(resolved)
}

async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((src_dir, dst_dir)) = stack.pop() {
        tokio::fs::create_dir_all(&dst_dir).await?;
        let mut entries = tokio::fs::read_dir(&src_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dst_path = dst_dir.join(entry.file_name());
            if file_type.is_dir() {
                stack.push((entry.path(), dst_path));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), dst_path).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_parent_escape() {
        let root = Path::new("/tmp/workspace");
        let result = safe_join(root, "../../etc/passwd");
        assert!(result.is_err());
    }

    #[test]
    fn safe_join_allows_nested_path() {
        let root = Path::new("/tmp/workspace");
        let result = safe_join(root, "main.tf").unwrap();
        assert_eq!(result, root.join("main.tf"));
    }

    #[test]
    fn safe_join_allows_subdirectory() {
        let root = Path::new("/tmp/workspace");
        let result = safe_join(root, "modules/net/main.tf").unwrap();
        assert_eq!(result, root.join("modules").join("net").join("main.tf"));
    }

    #[tokio::test]
    async fn prepare_rejects_job_with_no_workspace_source() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs.ext4");
        tokio::fs::write(&rootfs, b"fake rootfs").await.unwrap();

        let spec = SandboxSpec {
            job_id: "job-1".into(),
            task_id: "task-1".into(),
            miner_uid: None,
            workspace_zip: None,
            workspace_dir: None,
            task_json: serde_json::json!({}),
            timeout_s: 60,
            net_checks: false,
            quiet_kernel: true,
        };

        let result = prepare(tmp.path(), &rootfs, &spec).await;
        assert!(matches!(result, Err(SandboxError::BadRequest(_))));
    }
}
