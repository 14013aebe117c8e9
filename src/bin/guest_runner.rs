//! Guest-side orchestration binary: runs inside the sandbox VM, drives
//! Terraform (unless `SKIP_TF=1`) and then the task validator, and
//! guarantees a `success.json` or `error.json` lands in `RESULTS_DIR`
//! before exit, synced to disk, with any OAuth token scrubbed from every
//! message that could reach a log or result file.
//!
//! Grounded on `guest_runner.py` (overall control flow) and
//! `terraform_runner.py` (the terraform phase, run as an internal
//! submodule here rather than a second `python3` subprocess).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use acore_sandbox::redact::redact_str;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const TAIL_LINES: usize = 50;

fn guest_log(message: impl AsRef<str>) {
    println!("[Guest] {}", message.as_ref());
}

async fn sync_disk() {
    let _ = Command::new("sync").status().await;
}

/// Resolves the OAuth access token, preferring the `GOOGLE_OAUTH_ACCESS_TOKEN`
/// environment variable but falling back to a file path named by
/// `TOKEN_FILE` — the launcher uses the file form so the token never
/// appears in a process argument list or the kernel command line.
async fn resolve_token() -> Option<String> {
    if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
        return Some(token);
    }
    let token_file = std::env::var("TOKEN_FILE").ok()?;
    let contents = tokio::fs::read_to_string(token_file).await.ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Writes `error.json` to `results_dir`, scrubbing the OAuth token out of
/// `msg` first. Best-effort: a failure to write is logged, never panics,
/// matching the original's `write_error_json`.
async fn write_error_json(results_dir: &Path, msg: &str, score: Option<f64>) {
    let token = resolve_token().await;
    let sanitized = redact_str(msg, token.as_deref());

    let mut payload = json!({ "msg": sanitized });
    if let Some(score) = score {
        payload["score"] = json!(score);
    }

    if let Err(err) = tokio::fs::create_dir_all(results_dir).await {
        eprintln!("[Guest] Failed to create results dir: {err}");
        sync_disk().await;
        return;
    }
    let path = results_dir.join("error.json");
    if let Err(err) = tokio::fs::write(&path, payload.to_string()).await {
        eprintln!("[Guest] Failed to write error.json: {err}");
    }
    sync_disk().await;
}

/// Runs a command to completion, pumping stdout/stderr through to this
/// process's own streams live while retaining a bounded tail for failure
/// summaries. Mirrors `run_streaming`'s threaded pump with tokio tasks.
struct StreamedOutput {
    status: std::process::ExitStatus,
    stdout_tail: VecDeque<String>,
    stderr_tail: VecDeque<String>,
}

async fn run_streaming(cmd: &mut Command, label: &str) -> anyhow::Result<StreamedOutput> {
    guest_log(format!("{label}..."));

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_task = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(TAIL_LINES);
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            println!("{line}");
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    });

    let stderr_task = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            eprintln!("{line}");
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    });

    let status = child.wait().await?;
    let stdout_tail = stdout_task.await.unwrap_or_default();
    let stderr_tail = stderr_task.await.unwrap_or_default();

    Ok(StreamedOutput {
        status,
        stdout_tail,
        stderr_tail,
    })
}

/// Prefers the stderr tail, falling back to stdout, matching
/// `snippet_lines = list(stderr_buf) or list(stdout_buf)`.
fn summarize_failure(
    prefix: &str,
    status: &std::process::ExitStatus,
    stdout_tail: &VecDeque<String>,
    stderr_tail: &VecDeque<String>,
) -> String {
    let rc = status.code().unwrap_or(-1);
    let tail = if stderr_tail.is_empty() { stdout_tail } else { stderr_tail };
    let snippet: String = tail.iter().cloned().collect::<Vec<_>>().join("\n");
    let snippet = snippet.trim();
    if snippet.is_empty() {
        format!("{prefix} failed (rc={rc})")
    } else {
        let clipped = if snippet.len() > 800 {
            &snippet[snippet.len() - 800..]
        } else {
            snippet
        };
        format!("{prefix} failed (rc={rc}): {clipped}")
    }
}

mod terraform {
    use super::*;

    const BUNDLE_ROOT: &str = "/opt/acore-sandbox-bundle";

    /// Runs `terraform init` then `terraform apply -refresh-only`, writing
    /// `error.json` itself on failure (the original's `terraform_runner.py`
    /// writes its own `status: "error"` payload rather than deferring to
    /// the caller). Returns `Ok(())` only if both steps exit 0.
    pub async fn run(workdir: &Path, results_dir: &Path) -> anyhow::Result<()> {
        let result_error = std::env::var("TF_ERROR_JSON")
            .map(PathBuf::from)
            .unwrap_or_else(|_| results_dir.join("error.json"));

        let token = resolve_token().await;

        let write_tf_error = |msg: String| {
            let result_error = result_error.clone();
            let token = token.clone();
            async move {
                let sanitized = redact_str(&msg, token.as_deref());
                let payload = json!({ "status": "error", "msg": sanitized, "score": 0 });
                if let Some(parent) = result_error.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                let _ = tokio::fs::write(&result_error, payload.to_string()).await;
                sync_disk().await;
            }
        };

        if token.is_none() {
            eprintln!("[Runner] ERROR: GOOGLE_OAUTH_ACCESS_TOKEN is not set; aborting.");
            write_tf_error("GOOGLE_OAUTH_ACCESS_TOKEN is not set".into()).await;
            anyhow::bail!("missing token");
        }

        let tf_bin = PathBuf::from(BUNDLE_ROOT).join("bin").join("terraform");
        if !tf_bin.is_file() {
            eprintln!("[Runner] ERROR: terraform binary not found at {}", tf_bin.display());
            write_tf_error("terraform binary not found in bundle".into()).await;
            anyhow::bail!("terraform binary missing");
        }

        if !results_dir.is_dir() {
            eprintln!("[Runner] ERROR: RESULTS_DIR missing or not a directory: {}", results_dir.display());
            anyhow::bail!("results dir missing");
        }

        let home = std::env::var("HOME").unwrap_or_else(|_| workdir.display().to_string());
        let path = format!("{BUNDLE_ROOT}/bin:/usr/local/bin:/usr/bin:/bin");
        let tf_rc = PathBuf::from(BUNDLE_ROOT).join("config").join("terraform.rc");

        let mut build_cmd = |args: &[&str]| {
            let mut cmd = Command::new(&tf_bin);
            cmd.args(args)
                .current_dir(workdir)
                .env("PATH", &path)
                .env("HOME", &home)
                .env("TF_IN_AUTOMATION", "1")
                .env("GOOGLE_OAUTH_ACCESS_TOKEN", token.as_deref().unwrap_or_default());
            if tf_rc.exists() {
                cmd.env("TF_CLI_CONFIG_FILE", &tf_rc);
            }
            // http_proxy/https_proxy are set by the launcher on this
            // process's own environment before it execs us, scoped to this
            // job's slot; Terraform inherits them from `cmd`'s parent env
            // automatically unless we've already overridden PATH/HOME above.
            cmd
        };

        let mut init_cmd = build_cmd(&["init", "-input=false", "-backend=false", "-no-color"]);
        let init = run_streaming(&mut init_cmd, "terraform init").await?;
        if !init.status.success() {
            let msg = summarize_failure("terraform init", &init.status, &init.stdout_tail, &init.stderr_tail);
            write_tf_error(msg).await;
            anyhow::bail!("terraform init failed");
        }

        let mut apply_cmd = build_cmd(&["apply", "-refresh-only", "-auto-approve", "-no-color"]);
        let apply = run_streaming(&mut apply_cmd, "terraform apply").await?;
        if !apply.status.success() {
            let msg = summarize_failure("terraform apply", &apply.status, &apply.stdout_tail, &apply.stderr_tail);
            write_tf_error(msg).await;
            anyhow::bail!("terraform apply failed");
        }

        Ok(())
    }
}

async fn run() -> anyhow::Result<i32> {
    let workdir = std::env::var("WORKDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let workdir = tokio::fs::canonicalize(&workdir).await.unwrap_or(workdir);

    let results_dir = std::env::var("RESULTS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./results"));

    let validator_dir = std::env::var("VALIDATOR_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/validator"));

    let skip_tf = std::env::var("SKIP_TF").as_deref() == Ok("1");

    let task_json_path = std::env::var("TASK_JSON_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| workdir.join("task.json"));

    let tfstate_path = std::env::var("TFSTATE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| workdir.join("terraform.tfstate"));

    let Some(token) = resolve_token().await else {
        write_error_json(&results_dir, "Missing GOOGLE_OAUTH_ACCESS_TOKEN", None).await;
        return Ok(1);
    };

    if std::env::var("NET_CHECKS").as_deref() == Ok("1") {
        guest_log("Running network self-check...");
        let mut cmd = Command::new("guest-netcheck");
        let probe = run_streaming(&mut cmd, "guest-netcheck").await?;
        if !probe.status.success() {
            let msg = summarize_failure("Proxy not reachable", &probe.status, &probe.stdout_tail, &probe.stderr_tail);
            write_error_json(&results_dir, &msg, None).await;
            return Ok(1);
        }
    }

    if !skip_tf {
        guest_log("Running terraform runner...");
        if let Err(err) = terraform::run(&workdir, &results_dir).await {
            if !results_dir.join("error.json").exists() {
                write_error_json(&results_dir, &format!("Terraform runner failed: {err}"), None).await;
            }
            return Ok(1);
        }
    } else {
        guest_log("Skipping terraform execution (SKIP_TF=1).");
    }

    let validate_script = validator_dir.join("validate.py");
    if !validate_script.exists() {
        write_error_json(
            &results_dir,
            &format!("Validator script not found at {}", validate_script.display()),
            None,
        )
        .await;
        return Ok(1);
    }

    guest_log("Running validator...");
    let mut cmd = Command::new("python3");
    cmd.arg(&validate_script)
        .arg("-t")
        .arg(&task_json_path)
        .arg("-s")
        .arg(&tfstate_path)
        .arg("--success-json")
        .arg(results_dir.join("success.json"))
        .arg("--error-json")
        .arg(results_dir.join("error.json"))
        .current_dir(&workdir)
        .env("GOOGLE_OAUTH_ACCESS_TOKEN", &token);

    let validator = run_streaming(&mut cmd, "Running validator").await?;
    if !validator.status.success() {
        if !results_dir.join("error.json").exists() {
            let msg = summarize_failure("Validator", &validator.status, &validator.stdout_tail, &validator.stderr_tail);
            write_error_json(&results_dir, &msg, None).await;
        }
        return Ok(1);
    }

    Ok(0)
}

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(code) => code,
        Err(err) => {
            let results_dir = std::env::var("RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./results"));
            write_error_json(&results_dir, &format!("Guest runner exception: {err}"), None).await;
            1
        }
    };
    sync_disk().await;
    std::process::exit(exit_code);
}
