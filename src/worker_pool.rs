//! Bounded-concurrency worker pool gating sandbox VM launches.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::credentials::CredentialProvider;
use crate::error::{Result, SandboxError};
use crate::sandbox::launcher::SandboxLauncher;
use crate::sandbox::types::{JobResult, SandboxSpec};

/// Serializes concurrent VM launches behind a counting semaphore, matching
/// the original's `asyncio.Semaphore`-gated `_run_one`. Acquiring a permit
/// is an RAII guard, so cancellation (e.g. the caller's future is dropped)
/// never leaks a slot.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
    launcher: Arc<SandboxLauncher>,
    credentials: Arc<dyn CredentialProvider>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, launcher: Arc<SandboxLauncher>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            launcher,
            credentials,
        }
    }

    /// Count of jobs currently executing (permits in use). Exposed for the
    /// `/validate/active` endpoint and queue admission heuristics.
    pub fn active_count(&self) -> usize {
        self.max_workers() - self.semaphore.available_permits()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub async fn run(&self, spec: SandboxSpec) -> Result<JobResult> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::Internal("worker pool semaphore closed".into()))?;

        let token = self.credentials.get_token().await.ok();
        let result = self.launcher.run_job(spec, token).await;
        drop(permit);
        result
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialProvider;
    use crate::sandbox::launcher::LauncherConfig;
    use crate::sandbox::slots::SlotAllocator;
    use std::path::PathBuf;

    fn dummy_pool(max_workers: usize) -> WorkerPool {
        let config = LauncherConfig {
            workspace_root: PathBuf::from("/tmp"),
            firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
            jailer_bin: PathBuf::from("/usr/local/bin/jailer"),
            kernel_image: PathBuf::from("/tmp/vmlinux"),
            rootfs_base_image: PathBuf::from("/tmp/rootfs.ext4"),
            chroot_base: PathBuf::from("/tmp/jailer"),
            guest_ssh_key: PathBuf::from("/tmp/guest_ssh_key"),
        };
        let launcher = Arc::new(SandboxLauncher::new(config, Arc::new(SlotAllocator::new(0, 10_000))));
        let creds = Arc::new(StaticCredentialProvider::new("tok".into()));
        WorkerPool::new(max_workers, launcher, creds)
    }

    #[test]
    fn active_count_starts_at_zero() {
        let pool = dummy_pool(3);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.available_permits(), 3);
    }
}
