//! Job queue and record store: bounded FIFO admission, the in-memory job
//! map, and the submission archive (hash, metadata sidecar, best-effort
//! `by_task`/`by_miner` secondary indexes).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::queue::record::{JobPhase, JobRecord, JobResult};
use crate::sandbox::types::SandboxSpec;

/// A job handed to the worker loop, paired with the one-shot channel its
/// result is delivered through.
pub struct QueuedJob {
    pub spec: SandboxSpec,
    pub result_tx: oneshot::Sender<JobResult>,
}

pub struct JobQueueLayout {
    pub log_dir: PathBuf,
    pub archive_root: PathBuf,
}

/// Resolves a path and ensures it stays within `root`, rejecting traversal
/// regardless of whether the target exists yet.
fn contained_within(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            std::path::Component::Normal(seg) => normalized.push(seg),
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !normalized.pop() {
                    return Err(SandboxError::Forbidden(format!(
                        "path escapes root: {}",
                        candidate.display()
                    )));
                }
            }
            std::path::Component::RootDir | std::path::Component::Prefix(_) => {}
        }
    }
    Ok(root.join(normalized))
}

pub(crate) fn safe_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub struct JobQueue {
    jobs: RwLock<HashMap<String, JobRecord>>,
    sender: mpsc::Sender<QueuedJob>,
    receiver: Mutex<Option<mpsc::Receiver<QueuedJob>>>,
    layout: JobQueueLayout,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize, layout: JobQueueLayout) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(capacity);
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            layout,
            capacity,
        })
    }

    /// Configured bound on in-flight (queued + dispatched-but-unreceived)
    /// jobs, surfaced on `/health` as `sandbox_queue_size`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs currently sitting in the channel, awaiting a worker to `recv()`
    /// them. Surfaced on `/health` as `sandbox_queued`.
    pub fn queued_count(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    /// Root directory submissions (and their `by_task`/`by_miner` indexes)
    /// are archived under. Exposed for `GET /task/{task_id}`'s
    /// `submission_index_dir` field.
    pub fn archive_root(&self) -> &Path {
        &self.layout.archive_root
    }

    /// Takes ownership of the receiving half. Called exactly once, by the
    /// worker loop at startup.
    pub async fn take_receiver(&self) -> mpsc::Receiver<QueuedJob> {
        self.receiver
            .lock()
            .await
            .take()
            .expect("queue receiver already taken")
    }

    /// Admits a job: persists the submission archive, registers the job
    /// record, and enqueues it for the worker pool. Returns `Busy` if the
    /// bounded queue is full, matching `validation_api.py`'s
    /// `asyncio.QueueFull` → 429 handling.
    pub async fn submit(
        &self,
        workspace_zip: &Path,
        task_json: serde_json::Value,
        timeout_s: u64,
        net_checks: bool,
        quiet_kernel: bool,
    ) -> Result<(JobRecord, oneshot::Receiver<JobResult>)> {
        let task_id = task_json
            .get("task_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_default();
        let miner_uid = task_json
            .get("miner_uid")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let job_id = Uuid::new_v4().simple().to_string();
        let request_id = Uuid::new_v4().simple().to_string()[..12].to_string();

        let prefix = if task_id.is_empty() {
            String::new()
        } else {
            format!("{}__", safe_name(&task_id))
        };

        let stored = self
            .persist_submission(workspace_zip, &job_id, &prefix, task_id.as_str(), miner_uid.as_deref())
            .await?;

        let log_path = self.layout.log_dir.join(format!("{prefix}{job_id}.log"));

        let mut record = JobRecord::new(job_id.clone(), request_id, task_id, miner_uid);
        record.stored_submission_path = Some(stored);

        let (result_tx, result_rx) = oneshot::channel();

        let spec = SandboxSpec {
            job_id: job_id.clone(),
            task_id: record.task_id.clone(),
            miner_uid: record.miner_uid.clone(),
            workspace_zip: record.stored_submission_path.clone(),
            workspace_dir: None,
            task_json,
            timeout_s: timeout_s.max(1),
            net_checks,
            quiet_kernel,
        };

        self.sender
            .try_send(QueuedJob { spec, result_tx })
            .map_err(|_| SandboxError::Busy)?;

        record.log_path = Some(log_path);
        self.jobs.write().await.insert(job_id.clone(), record.clone());

        Ok((record, result_rx))
    }

    async fn persist_submission(
        &self,
        workspace_zip: &Path,
        job_id: &str,
        prefix: &str,
        task_id: &str,
        miner_uid: Option<&str>,
    ) -> Result<PathBuf> {
        let submissions_dir = &self.layout.archive_root;
        tokio::fs::create_dir_all(submissions_dir).await?;

        let submission_path = submissions_dir.join(format!("{prefix}{job_id}.zip"));
        let meta_path = submissions_dir.join(format!("{prefix}{job_id}.json"));
        let tmp_path = submission_path.with_extension("zip.tmp");

        let _ = tokio::fs::remove_file(&tmp_path).await;

        match tokio::fs::hard_link(workspace_zip, &tmp_path).await {
            Ok(()) => {}
            Err(_) => {
                tokio::fs::copy(workspace_zip, &tmp_path).await.map_err(|err| {
                    SandboxError::Internal(format!("failed to persist submission: {err}"))
                })?;
            }
        }
        tokio::fs::rename(&tmp_path, &submission_path).await?;

        let bytes = tokio::fs::read(&submission_path).await?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash = format!("{:x}", hasher.finalize());

        let meta = serde_json::json!({
            "job_id": job_id,
            "task_id": task_id,
            "miner_uid": miner_uid,
            "stored_path": submission_path,
            "sha256": hash,
            "bytes": bytes.len(),
        });
        let _ = tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await;

        if !task_id.is_empty() {
            self.link_index("by_task", task_id, job_id, prefix, &submission_path, &meta_path)
                .await;
        }
        if let Some(miner_uid) = miner_uid {
            self.link_index("by_miner", miner_uid, job_id, prefix, &submission_path, &meta_path)
                .await;
        }

        Ok(submission_path)
    }

    /// Best-effort secondary index: failures (permission errors, unsupported
    /// filesystem) are logged and swallowed, never escalated, matching the
    /// original's `except Exception: pass` guards.
    async fn link_index(
        &self,
        kind: &str,
        key: &str,
        job_id: &str,
        prefix: &str,
        submission_path: &Path,
        meta_path: &Path,
    ) {
        let index_dir = self.layout.archive_root.join(kind).join(safe_name(key));
        if let Err(err) = tokio::fs::create_dir_all(&index_dir).await {
            tracing::debug!(kind, key, error = %err, "failed to create secondary index dir");
            return;
        }

        let zip_link = index_dir.join(format!("{prefix}{job_id}.zip"));
        let meta_link = index_dir.join(format!("{prefix}{job_id}.json"));
        let _ = tokio::fs::remove_file(&zip_link).await;
        let _ = tokio::fs::remove_file(&meta_link).await;

        #[cfg(unix)]
        {
            if let Err(err) = tokio::fs::symlink(submission_path, &zip_link).await {
                tracing::debug!(kind, key, error = %err, "failed to symlink submission into secondary index");
            }
            if let Err(err) = tokio::fs::symlink(meta_path, &meta_link).await {
                tracing::debug!(kind, key, error = %err, "failed to symlink metadata into secondary index");
            }
        }
    }

    pub async fn mark_running(&self, job_id: &str) {
        let log_path;
        let task_id;
        let miner_uid;
        {
            let mut jobs = self.jobs.write().await;
            let Some(record) = jobs.get_mut(job_id) else { return };
            log_path = record
                .log_path
                .clone()
                .unwrap_or_else(|| self.layout.log_dir.join(format!("{job_id}.log")));
            record.mark_running(log_path.clone());
            task_id = record.task_id.clone();
            miner_uid = record.miner_uid.clone();
        }
        self.link_log_index(job_id, &log_path, task_id.as_str(), miner_uid.as_deref())
            .await;
    }

    pub async fn mark_done(&self, job_id: &str, result: JobResult) {
        if let Some(record) = self.jobs.write().await.get_mut(job_id) {
            record.mark_done(result);
        }
        self.unlink_active_log(job_id).await;
    }

    /// Records a host-side failure (the VM never produced a result at all)
    /// distinct from a guest-reported `JobResult`.
    pub async fn mark_failed(&self, job_id: &str, error: impl Into<String>, log_tail: Vec<String>) {
        if let Some(record) = self.jobs.write().await.get_mut(job_id) {
            record.mark_failed(error, log_tail);
        }
        self.unlink_active_log(job_id).await;
    }

    /// Mirrors the submission archive's `by_task`/`by_miner` indexing for
    /// log files: an `active/` symlink while the job is in flight plus
    /// `by_task`/`by_miner` symlinks for later lookup, all best-effort.
    async fn link_log_index(&self, job_id: &str, log_path: &Path, task_id: &str, miner_uid: Option<&str>) {
        let active_dir = self.layout.log_dir.join("active");
        if tokio::fs::create_dir_all(&active_dir).await.is_ok() {
            let link = active_dir.join(format!("{job_id}.log"));
            let _ = tokio::fs::remove_file(&link).await;
            #[cfg(unix)]
            {
                if let Err(err) = tokio::fs::symlink(log_path, &link).await {
                    tracing::debug!(job_id, error = %err, "failed to symlink active log");
                }
            }
        }

        if !task_id.is_empty() {
            self.link_log_by(job_id, log_path, "by_task", task_id).await;
        }
        if let Some(miner_uid) = miner_uid {
            self.link_log_by(job_id, log_path, "by_miner", miner_uid).await;
        }
    }

    async fn link_log_by(&self, job_id: &str, log_path: &Path, kind: &str, key: &str) {
        let index_dir = self.layout.log_dir.join(kind).join(safe_name(key));
        if let Err(err) = tokio::fs::create_dir_all(&index_dir).await {
            tracing::debug!(kind, key, error = %err, "failed to create secondary log index dir");
            return;
        }
        let link = index_dir.join(format!("{job_id}.log"));
        let _ = tokio::fs::remove_file(&link).await;
        #[cfg(unix)]
        {
            if let Err(err) = tokio::fs::symlink(log_path, &link).await {
                tracing::debug!(kind, key, error = %err, "failed to symlink log into secondary index");
            }
        }
    }

    async fn unlink_active_log(&self, job_id: &str) {
        let link = self.layout.log_dir.join("active").join(format!("{job_id}.log"));
        let _ = tokio::fs::remove_file(&link).await;
    }

    pub async fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn list_active(&self) -> Vec<JobRecord> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|r| matches!(r.phase, JobPhase::Queued | JobPhase::Running))
            .cloned()
            .collect()
    }

    pub async fn list_for_task(&self, task_id: &str) -> Vec<JobRecord> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Resolves a job's log file path, rejecting any resolution that would
    /// escape the configured log directory (spec §6.1's 403 boundary check).
    pub fn resolve_log_path(&self, log_path: &Path) -> Result<PathBuf> {
        let relative = log_path.strip_prefix(&self.layout.log_dir).unwrap_or(log_path);
        contained_within(&self.layout.log_dir, relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contained_within_rejects_escape() {
        let root = Path::new("/var/log/acore");
        let result = contained_within(root, Path::new("../../etc/passwd"));
        assert!(result.is_err());
    }

    #[test]
    fn contained_within_allows_nested_path() {
        let root = Path::new("/var/log/acore");
        let result = contained_within(root, Path::new("job-1.log")).unwrap();
        assert_eq!(result, root.join("job-1.log"));
    }

    #[test]
    fn safe_name_strips_unsafe_chars() {
        assert_eq!(safe_name("task/../etc"), "task_.._etc");
        assert_eq!(safe_name("miner-123_x"), "miner-123_x");
    }

    #[tokio::test]
    async fn submit_rejects_when_queue_full() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("workspace.zip");
        tokio::fs::write(&zip_path, b"fake zip").await.unwrap();

        let layout = JobQueueLayout {
            log_dir: tmp.path().join("logs"),
            archive_root: tmp.path().join("submissions"),
        };
        let queue = JobQueue::new(1, layout);

        let first = queue
            .submit(&zip_path, serde_json::json!({"task_id": "t1"}), 60, false, true)
            .await;
        assert!(first.is_ok());

        let second = queue
            .submit(&zip_path, serde_json::json!({"task_id": "t2"}), 60, false, true)
            .await;
        assert!(matches!(second, Err(SandboxError::Busy)));
    }

    #[tokio::test]
    async fn submit_persists_and_indexes_by_task() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("workspace.zip");
        tokio::fs::write(&zip_path, b"fake zip").await.unwrap();

        let layout = JobQueueLayout {
            log_dir: tmp.path().join("logs"),
            archive_root: tmp.path().join("submissions"),
        };
        let queue = JobQueue::new(4, layout);

        let (record, _rx) = queue
            .submit(&zip_path, serde_json::json!({"task_id": "task-42"}), 60, false, true)
            .await
            .unwrap();

        assert!(record.stored_submission_path.as_ref().unwrap().exists());
        let by_task_dir = tmp.path().join("submissions").join("by_task").join("task-42");
        assert!(by_task_dir.exists());
    }
}
