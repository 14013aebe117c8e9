//! Jailer + Firecracker process spawn and API-socket readiness wait —
//! launcher phase 5.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::sleep;

use crate::error::{Result, SandboxError};
use crate::sandbox::slots::VmSlot;

/// A running jailer-wrapped Firecracker process, prior to guest boot.
pub struct JailedFirecracker {
    pub child: Child,
    pub api_socket: PathBuf,
}

/// Spawn `jailer` wrapping `firecracker`, chrooting it into `chroot_base`
/// under the slot's allocated uid/gid, and wait for the Firecracker API
/// socket to appear.
pub async fn spawn(
    jailer_bin: &Path,
    firecracker_bin: &Path,
    chroot_base: &Path,
    vm_id: &str,
    slot: &VmSlot,
) -> Result<JailedFirecracker> {
    tokio::fs::create_dir_all(chroot_base).await?;

    let child = Command::new(jailer_bin)
        .args([
            "--id",
            vm_id,
            "--exec-file",
            &firecracker_bin.to_string_lossy(),
            "--uid",
            &slot.jailer_uid.to_string(),
            "--gid",
            &slot.jailer_gid.to_string(),
            "--chroot-base-dir",
            &chroot_base.to_string_lossy(),
            "--",
            "--api-sock",
            "/run/firecracker.socket",
        ])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|err| SandboxError::Internal(format!("failed to start jailer: {err}")))?;

    let api_socket = chroot_base
        .join("firecracker")
        .join(vm_id)
        .join("root")
        .join("run")
        .join("firecracker.socket");

    wait_for_socket(&api_socket, Duration::from_secs(5)).await?;

    Ok(JailedFirecracker { child, api_socket })
}

async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if path.exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SandboxError::Internal(format!(
                "firecracker API socket did not appear at {} within {timeout:?}",
                path.display()
            )));
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_socket_times_out_if_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("never-created.socket");
        let result = wait_for_socket(&missing, Duration::from_millis(100)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_socket_succeeds_once_present() {
        let tmp = tempfile::tempdir().unwrap();
        let socket_path = tmp.path().join("present.socket");
        tokio::fs::write(&socket_path, b"").await.unwrap();
        let result = wait_for_socket(&socket_path, Duration::from_millis(100)).await;
        assert!(result.is_ok());
    }
}
