use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A sandbox job as submitted to the worker pool. Carries everything the
/// launcher needs to provision a VM and nothing it doesn't: the workspace
/// bundle, the task manifest, and per-job overrides.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub job_id: String,
    pub task_id: String,
    pub miner_uid: Option<String>,
    pub workspace_zip: Option<PathBuf>,
    pub workspace_dir: Option<PathBuf>,
    pub task_json: serde_json::Value,
    pub timeout_s: u64,
    pub net_checks: bool,
    pub quiet_kernel: bool,
}

impl SandboxSpec {
    pub fn new_job_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Phase of a job's lifecycle, tracked by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Running,
    Done,
    Failed,
}

/// Pass/fail verdict normalized from the guest's result artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pass,
    Fail,
}

/// The result artifact produced by a sandbox run, after normalization.
///
/// Resolves Open Question 2 (see DESIGN.md): the guest may write
/// `status: "error"` (Terraform stage) or `status: "fail"` (validator
/// stage) — both collapse to `JobStatus::Fail` here so every caller only
/// has to handle pass/fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    pub score: f64,
    pub msg: Option<String>,
    pub returncode: i32,
    pub log_tail: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
}

impl JobResult {
    pub fn synthesize_failure(job_id: &str, returncode: i32, reason: impl Into<String>, log_tail: Vec<String>) -> Self {
        JobResult {
            job_id: job_id.to_string(),
            status: JobStatus::Fail,
            score: 0.0,
            msg: Some(reason.into()),
            returncode,
            log_tail,
            tap: None,
        }
    }

    /// Synthesizes a result when the guest halted without leaving a
    /// success.json/error.json artifact behind: pass iff the VM's own exit
    /// code was 0, matching the shell convention the guest runner follows.
    pub fn synthesize_missing_artifact(job_id: &str, returncode: i32, log_tail: Vec<String>) -> Self {
        let status = if returncode == 0 { JobStatus::Pass } else { JobStatus::Fail };
        JobResult {
            job_id: job_id.to_string(),
            status,
            score: if returncode == 0 { 1.0 } else { 0.0 },
            msg: Some("guest produced no result artifact".into()),
            returncode,
            log_tail,
            tap: None,
        }
    }

    pub fn with_tap(mut self, tap: Option<String>) -> Self {
        self.tap = tap;
        self
    }
}

/// Normalizes a raw `result.json`/`error.json` payload into a `JobResult`.
///
/// Accepts either `status: "fail"` or `status: "error"` as a failure; any
/// other (or missing) status with no parse error is treated as a pass only
/// if explicitly marked `"pass"` or `success: true` — everything else
/// defaults to fail, matching the original's conservative default.
pub fn normalize_result(job_id: &str, raw: &serde_json::Value, returncode: i32, log_tail: Vec<String>) -> JobResult {
    let status_field = raw.get("status").and_then(|v| v.as_str());
    let success_field = raw.get("success").and_then(|v| v.as_bool());

    let status = match (status_field, success_field) {
        (Some("pass"), _) => JobStatus::Pass,
        (Some("fail"), _) | (Some("error"), _) => JobStatus::Fail,
        (None, Some(true)) => JobStatus::Pass,
        (None, Some(false)) => JobStatus::Fail,
        _ if returncode == 0 => JobStatus::Pass,
        _ => JobStatus::Fail,
    };

    let score = raw.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);

    let msg = raw
        .get("msg")
        .or_else(|| raw.get("error"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    JobResult {
        job_id: job_id.to_string(),
        status,
        score,
        msg,
        returncode,
        log_tail,
        tap: None,
    }
}

/// The persisted record of a job across its lifecycle, held by the job
/// queue/store and surfaced through `/validate/{job_id}`.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub request_id: String,
    pub task_id: String,
    pub miner_uid: Option<String>,
    pub phase: JobPhase,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_path: Option<PathBuf>,
    pub stored_submission_path: Option<PathBuf>,
    pub result: Option<JobResult>,
    /// Host-side failure (launcher/VM error) distinct from a guest-reported
    /// `result` — e.g. "rootfs base image missing" never reaches the guest
    /// at all, so it has no result to normalize.
    pub error: Option<String>,
    pub log_tail: Vec<String>,
}

impl JobRecord {
    pub fn new(job_id: String, request_id: String, task_id: String, miner_uid: Option<String>) -> Self {
        Self {
            job_id,
            request_id,
            task_id,
            miner_uid,
            phase: JobPhase::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            log_path: None,
            stored_submission_path: None,
            result: None,
            error: None,
            log_tail: Vec::new(),
        }
    }

    pub fn mark_running(&mut self, log_path: PathBuf) {
        self.phase = JobPhase::Running;
        self.started_at = Some(Utc::now());
        self.log_path = Some(log_path);
    }

    pub fn mark_done(&mut self, result: JobResult) {
        self.phase = match result.status {
            JobStatus::Pass => JobPhase::Done,
            JobStatus::Fail => JobPhase::Failed,
        };
        self.finished_at = Some(Utc::now());
        self.log_tail = result.log_tail.clone();
        self.result = Some(result);
    }

    /// Records a host-side failure that occurred before (or instead of) any
    /// guest result — e.g. the launcher never managed to boot a VM at all.
    pub fn mark_failed(&mut self, error: impl Into<String>, log_tail: Vec<String>) {
        self.phase = JobPhase::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
        self.log_tail = log_tail;
    }
}

/// Bounded tail buffer shared by the io relay and the guest-side runners:
/// keeps only the most recent `capacity` lines.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_vec(self) -> Vec<String> {
        self.lines.into_iter().collect()
    }

    pub fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_result_collapses_error_and_fail() {
        let error_payload = json!({"status": "error", "msg": "terraform init failed", "score": 0});
        let fail_payload = json!({"status": "fail", "msg": "validator rejected", "score": 0});

        let from_error = normalize_result("job-1", &error_payload, 1, vec![]);
        let from_fail = normalize_result("job-1", &fail_payload, 1, vec![]);

        assert_eq!(from_error.status, JobStatus::Fail);
        assert_eq!(from_fail.status, JobStatus::Fail);
    }

    #[test]
    fn normalize_result_recognizes_pass() {
        let payload = json!({"status": "pass", "score": 1.0});
        let result = normalize_result("job-1", &payload, 0, vec![]);
        assert_eq!(result.status, JobStatus::Pass);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn normalize_result_falls_back_to_exit_code_on_missing_status() {
        let payload = json!({});
        assert_eq!(normalize_result("job-1", &payload, 0, vec![]).status, JobStatus::Pass);
        assert_eq!(normalize_result("job-1", &payload, 1, vec![]).status, JobStatus::Fail);
    }

    #[test]
    fn normalize_result_reads_error_field_as_msg() {
        let payload = json!({"status": "error", "error": "boom"});
        let result = normalize_result("job-1", &payload, 1, vec![]);
        assert_eq!(result.msg.as_deref(), Some("boom"));
    }

    #[test]
    fn job_record_transitions_to_failed_on_fail_result() {
        let mut record = JobRecord::new("j1".into(), "r1".into(), "t1".into(), None);
        record.mark_running(PathBuf::from("/tmp/j1.log"));
        assert_eq!(record.phase, JobPhase::Running);
        record.mark_done(JobResult::synthesize_failure("j1", 1, "boom", vec![]));
        assert_eq!(record.phase, JobPhase::Failed);
    }

    #[test]
    fn job_record_transitions_to_done_on_pass_result() {
        let mut record = JobRecord::new("j1".into(), "r1".into(), "t1".into(), None);
        record.mark_running(PathBuf::from("/tmp/j1.log"));
        record.mark_done(JobResult {
            job_id: "j1".into(),
            status: JobStatus::Pass,
            score: 1.0,
            msg: None,
            returncode: 0,
            log_tail: vec![],
            tap: Some("fc-tap0".into()),
        });
        assert_eq!(record.phase, JobPhase::Done);
        assert_eq!(record.result.unwrap().tap.as_deref(), Some("fc-tap0"));
    }

    #[test]
    fn synthesize_missing_artifact_follows_exit_code() {
        let pass = JobResult::synthesize_missing_artifact("j1", 0, vec![]);
        assert_eq!(pass.status, JobStatus::Pass);
        assert_eq!(pass.score, 1.0);

        let fail = JobResult::synthesize_missing_artifact("j1", 1, vec![]);
        assert_eq!(fail.status, JobStatus::Fail);
        assert_eq!(fail.score, 0.0);
    }

    #[test]
    fn with_tap_sets_the_field() {
        let result = JobResult::synthesize_failure("j1", 1, "boom", vec![]).with_tap(Some("fc-tap3".into()));
        assert_eq!(result.tap.as_deref(), Some("fc-tap3"));
    }

    #[test]
    fn tail_buffer_drops_oldest_past_capacity() {
        let mut buf = TailBuffer::new(2);
        buf.push("a".into());
        buf.push("b".into());
        buf.push("c".into());
        assert_eq!(buf.into_vec(), vec!["b".to_string(), "c".to_string()]);
    }
}
