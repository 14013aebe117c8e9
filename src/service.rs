//! Ties the job queue, worker pool, and credential provider into the single
//! process-wide service instance described in the design notes (§9): no
//! module-level singletons, one `Service` built in `main` and shared with
//! HTTP handlers through axum's `State` extractor.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::credentials::CredentialProvider;
use crate::queue::{JobQueue, QueuedJob};
use crate::sandbox::types::{JobResult, SandboxSpec};
use crate::worker_pool::WorkerPool;

pub struct Service {
    pub queue: Arc<JobQueue>,
    pub pool: Arc<WorkerPool>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl Service {
    pub fn new(queue: Arc<JobQueue>, pool: Arc<WorkerPool>, credentials: Arc<dyn CredentialProvider>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            pool,
            credentials,
        })
    }

    /// Spawns the worker loop for the lifetime of the process: pulls queued
    /// jobs off the channel and drives each through the pool on its own
    /// task, so a slow VM never blocks the next job from leaving the queue
    /// (concurrency is bounded by the pool's semaphore, not by this loop).
    pub fn spawn_dispatch_loop(self: &Arc<Self>) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut receiver = service.queue.take_receiver().await;
            while let Some(QueuedJob { spec, result_tx }) = receiver.recv().await {
                let service = service.clone();
                tokio::spawn(async move {
                    service.run_job(spec, result_tx).await;
                });
            }
        });
    }

    async fn run_job(&self, spec: SandboxSpec, result_tx: oneshot::Sender<JobResult>) {
        let job_id = spec.job_id.clone();
        self.queue.mark_running(&job_id).await;

        match self.pool.run(spec).await {
            Ok(result) => {
                self.queue.mark_done(&job_id, result.clone()).await;
                // The HTTP await may already have timed out and dropped its
                // end of the channel; the job still ran to completion and
                // its record is terminal, matching the AwaitTimeout
                // propagation rule in spec §5.
                let _ = result_tx.send(result);
            }
            Err(err) => {
                // Never reached the guest at all (rootfs missing, jailer
                // spawn failed, ...): record it as a host-side error rather
                // than faking a guest result, so callers can tell the two
                // apart.
                self.queue.mark_failed(&job_id, err.to_string(), vec![]).await;
                let _ = result_tx.send(JobResult::synthesize_failure(&job_id, -1, err.to_string(), vec![]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialProvider;
    use crate::queue::JobQueueLayout;
    use crate::sandbox::launcher::{LauncherConfig, SandboxLauncher};
    use crate::sandbox::slots::SlotAllocator;
    use std::path::PathBuf;

    #[tokio::test]
    async fn dispatch_loop_resolves_result_channel_for_missing_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = JobQueueLayout {
            log_dir: tmp.path().join("logs"),
            archive_root: tmp.path().join("submissions"),
        };
        let queue = JobQueue::new(4, layout);

        let launcher_config = LauncherConfig {
            workspace_root: tmp.path().join("workspaces"),
            firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
            jailer_bin: PathBuf::from("/usr/local/bin/jailer"),
            kernel_image: tmp.path().join("vmlinux"),
            rootfs_base_image: tmp.path().join("rootfs.ext4"),
            chroot_base: tmp.path().join("jailer"),
            guest_ssh_key: tmp.path().join("guest_ssh_key"),
        };
        let launcher = Arc::new(SandboxLauncher::new(launcher_config, Arc::new(SlotAllocator::new(0, 10_000))));
        let pool = Arc::new(WorkerPool::new(1, launcher, Arc::new(StaticCredentialProvider::new("tok".into()))));
        let service = Service::new(queue.clone(), pool, Arc::new(StaticCredentialProvider::new("tok".into())));
        service.spawn_dispatch_loop();

        let zip_path = tmp.path().join("workspace.zip");
        tokio::fs::write(&zip_path, b"not a real zip").await.unwrap();

        let (_record, rx) = queue
            .submit(&zip_path, serde_json::json!({"task_id": "t1"}), 5, false, true)
            .await
            .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .expect("dispatch loop did not resolve in time")
            .expect("result channel dropped without a value");

        assert_eq!(result.status, crate::sandbox::types::JobStatus::Fail);
    }
}
