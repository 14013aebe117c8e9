//! Sandbox launcher: orchestrates the nine-phase VM lifecycle described in
//! the component design — scratch dir, rootfs clone, workspace injection,
//! slot allocation, jailer/Firecracker spawn, redacted IO relay, guest wait
//! with timeout, result extraction, and teardown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{Result, SandboxError};
use crate::sandbox::guest_agent::GuestAgent;
use crate::sandbox::io_relay::{self, SharedTail};
use crate::sandbox::jailer;
use crate::sandbox::net;
use crate::sandbox::rootfs;
use crate::sandbox::slots::SlotAllocator;
use crate::sandbox::types::{normalize_result, JobResult, SandboxSpec};
use crate::sandbox::vm_api::{self, BootConfig, FirecrackerApi};

/// Default vCPU/memory allocation for every sandbox VM. The workloads this
/// service runs (Terraform init/apply-refresh against a small task) do not
/// warrant per-job sizing.
const VM_VCPU_COUNT: u8 = 1;
const VM_MEM_SIZE_MIB: u32 = 512;

/// Guest-side paths the base rootfs image and the guest-runner binary agree
/// on — not per-job, so they're constants rather than config.
const GUEST_WORKDIR: &str = "/workspace";
const GUEST_RESULTS_DIR: &str = "/run/results";
const GUEST_TOKEN_FILE: &str = "/etc/acore/token";
const PROXY_PORT: u16 = 8888;

/// How long to wait for the guest's SSH daemon to come up after
/// `InstanceStart`, before giving up on the whole job.
const GUEST_BOOT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct LauncherConfig {
    pub workspace_root: PathBuf,
    pub firecracker_bin: PathBuf,
    pub jailer_bin: PathBuf,
    pub kernel_image: PathBuf,
    pub rootfs_base_image: PathBuf,
    pub chroot_base: PathBuf,
    /// Private key the host uses to SSH into every guest; the matching
    /// public key is baked into the rootfs image's authorized_keys at
    /// image-build time, outside this service's runtime scope.
    pub guest_ssh_key: PathBuf,
}

pub struct SandboxLauncher {
    config: LauncherConfig,
    slots: Arc<SlotAllocator>,
}

impl SandboxLauncher {
    pub fn new(config: LauncherConfig, slots: Arc<SlotAllocator>) -> Self {
        Self { config, slots }
    }

    /// Runs one job end to end. Never returns an `Err` that represents a
    /// guest-side or host-side sandbox failure — those are captured as a
    /// `JobResult` with `status: fail`, matching the spec's propagation
    /// rule that the sandbox path always produces a result. `Err` is
    /// reserved for failures that happen before a VM could even be
    /// attempted (bad request, disk full provisioning the scratch dir).
    pub async fn run_job(&self, spec: SandboxSpec, secret_token: Option<String>) -> Result<JobResult> {
        let vm_id = format!("vm-{}", spec.job_id);
        let workspace = rootfs::prepare(&self.config.workspace_root, &self.config.rootfs_base_image, &spec).await?;

        let slot_guard = self.slots.allocate(&vm_id);
        let slot = slot_guard.slot().clone();

        tracing::info!(
            job_id = %spec.job_id,
            vm_id = %vm_id,
            tap = %slot.tap_name,
            "launching sandbox VM"
        );

        if let Err(err) = net::setup(&slot).await {
            self.teardown(&vm_id, &slot, &workspace.scratch_dir).await;
            return Ok(JobResult::synthesize_failure(&spec.job_id, -1, err.to_string(), vec![]));
        }

        let tail = SharedTail::new();
        let timeout_duration = Duration::from_secs(spec.timeout_s);

        let run_result = timeout(
            timeout_duration,
            self.drive_vm(&vm_id, &workspace, &slot, &spec, &tail, secret_token.clone()),
        )
        .await;

        let result = match run_result {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => JobResult::synthesize_failure(&spec.job_id, -1, err.to_string(), tail.snapshot()),
            Err(_) => JobResult::synthesize_failure(&spec.job_id, -1, "sandbox run timed out", tail.snapshot()),
        };

        self.teardown(&vm_id, &slot, &workspace.scratch_dir).await;

        Ok(result)
    }

    async fn drive_vm(
        &self,
        vm_id: &str,
        workspace: &rootfs::JobWorkspace,
        slot: &crate::sandbox::slots::VmSlot,
        spec: &SandboxSpec,
        tail: &SharedTail,
        secret_token: Option<String>,
    ) -> Result<JobResult> {
        let jailed = jailer::spawn(
            &self.config.jailer_bin,
            &self.config.firecracker_bin,
            &self.config.chroot_base,
            vm_id,
            slot,
        )
        .await?;

        let api = FirecrackerApi::new(jailed.api_socket.clone());
        let boot_args = vm_api::build_boot_args(&slot.guest_ip, &slot.host_ip, spec.quiet_kernel);
        api.configure_and_boot(&BootConfig {
            kernel_image_path: &self.config.kernel_image,
            boot_args,
            rootfs_path: &workspace.rootfs_path,
            tap_name: &slot.tap_name,
            guest_mac: &slot.guest_mac,
            vcpu_count: VM_VCPU_COUNT,
            mem_size_mib: VM_MEM_SIZE_MIB,
        })
        .await?;

        let mut child = jailed.child;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Internal("firecracker child missing stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Internal("firecracker child missing stderr".into()))?;

        let log_path = workspace.scratch_dir.join("console.log");
        let stdout_task = io_relay::spawn_relay(stdout, tail.clone(), secret_token.clone(), Some(log_path.clone()));
        let stderr_task = io_relay::spawn_relay(stderr, tail.clone(), secret_token.clone(), Some(log_path));

        let agent = GuestAgent::new(slot.guest_ip.clone(), self.config.guest_ssh_key.clone());
        let outcome = self.run_guest_runner(&agent, workspace, slot, spec, tail, secret_token).await;

        // Best-effort: ask the guest to power off so Firecracker's own
        // process exits cleanly; if it doesn't within a few seconds the
        // jailer process is killed outright rather than leaking it.
        let _ = agent.exec(&[], "poweroff -f").await;
        let status = match timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                tracing::warn!(vm_id = %vm_id, error = %err, "failed to wait on firecracker");
                None
            }
            Err(_) => {
                tracing::warn!(vm_id = %vm_id, "firecracker did not exit after guest poweroff, killing");
                let _ = child.kill().await;
                None
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let returncode = status.and_then(|s| s.code()).unwrap_or(-1);
        outcome.map(|result| result.with_tap(Some(slot.tap_name.clone()))).or_else(|err| {
            Ok(JobResult::synthesize_failure(vm_id, returncode, err.to_string(), tail.snapshot()).with_tap(Some(slot.tap_name.clone())))
        })
    }

    /// Drives the guest side of phases 7-8: wait for SSH, push the
    /// workspace and token, invoke the guest runner with the environment
    /// contract it expects, and read back its result artifact.
    async fn run_guest_runner(
        &self,
        agent: &GuestAgent,
        workspace: &rootfs::JobWorkspace,
        slot: &crate::sandbox::slots::VmSlot,
        spec: &SandboxSpec,
        tail: &SharedTail,
        secret_token: Option<String>,
    ) -> Result<JobResult> {
        agent.wait_for_ready(GUEST_BOOT_TIMEOUT).await?;

        agent
            .exec(&[], &format!("mkdir -p {GUEST_WORKDIR} {GUEST_RESULTS_DIR}"))
            .await?;
        agent.put_dir(&workspace.workdir, GUEST_WORKDIR).await?;

        if let Some(token) = &secret_token {
            agent.write_remote_file(GUEST_TOKEN_FILE, token.as_bytes(), "600").await?;
        }

        let proxy_url = format!("http://{}:{PROXY_PORT}", slot.host_ip);
        let mut env: Vec<(&str, &str)> = vec![
            ("WORKDIR", GUEST_WORKDIR),
            ("RESULTS_DIR", GUEST_RESULTS_DIR),
            ("TASK_JSON_PATH", "/workspace/task.json"),
            ("TFSTATE_PATH", "/workspace/terraform.tfstate"),
            ("http_proxy", &proxy_url),
            ("https_proxy", &proxy_url),
            ("PROXY_URL", &proxy_url),
            ("ACORE_STATIC_DNS", &slot.host_ip),
        ];
        if secret_token.is_some() {
            env.push(("TOKEN_FILE", GUEST_TOKEN_FILE));
        }
        if spec.net_checks {
            env.push(("NET_CHECKS", "1"));
        }

        let run = agent.exec(&env, "/usr/local/bin/guest-runner").await?;
        for line in String::from_utf8_lossy(&run.stdout).lines().chain(String::from_utf8_lossy(&run.stderr).lines()) {
            tail.push(line.to_string());
        }
        let returncode = run.status.code().unwrap_or(-1);

        let readback = agent
            .exec(
                &[],
                &format!(
                    "sh -c 'if [ -f {r}/success.json ]; then echo MARKER:success; cat {r}/success.json; \
                     elif [ -f {r}/error.json ]; then echo MARKER:error; cat {r}/error.json; \
                     else echo MARKER:missing; fi'",
                    r = GUEST_RESULTS_DIR
                ),
            )
            .await?;

        let stdout = String::from_utf8_lossy(&readback.stdout);
        let Some((marker_line, rest)) = stdout.split_once('\n') else {
            return Ok(JobResult::synthesize_missing_artifact(&spec.job_id, returncode, tail.snapshot()));
        };

        match marker_line.trim() {
            "MARKER:missing" => Ok(JobResult::synthesize_missing_artifact(&spec.job_id, returncode, tail.snapshot())),
            "MARKER:success" | "MARKER:error" => match serde_json::from_str::<serde_json::Value>(rest) {
                Ok(parsed) => Ok(normalize_result(&spec.job_id, &parsed, returncode, tail.snapshot())),
                Err(_) => Ok(JobResult::synthesize_failure(
                    &spec.job_id,
                    returncode,
                    "failed to parse guest result artifact",
                    tail.snapshot(),
                )),
            },
            other => Ok(JobResult::synthesize_failure(
                &spec.job_id,
                returncode,
                format!("unrecognized result marker: {other}"),
                tail.snapshot(),
            )),
        }
    }

    async fn teardown(&self, vm_id: &str, slot: &crate::sandbox::slots::VmSlot, scratch_dir: &std::path::Path) {
        tracing::info!(vm_id = %vm_id, "tearing down sandbox VM");
        net::teardown(slot).await;
        if let Err(err) = tokio::fs::remove_dir_all(scratch_dir).await {
            tracing::debug!(vm_id = %vm_id, error = %err, "scratch dir cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launcher_config_paths_are_plain_buffers() {
        let config = LauncherConfig {
            workspace_root: PathBuf::from("/tmp/ws"),
            firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
            jailer_bin: PathBuf::from("/usr/local/bin/jailer"),
            kernel_image: PathBuf::from("/tmp/vmlinux"),
            rootfs_base_image: PathBuf::from("/tmp/rootfs.ext4"),
            chroot_base: PathBuf::from("/srv/jailer"),
            guest_ssh_key: PathBuf::from("/etc/acore/guest_ssh_key"),
        };
        assert_eq!(config.workspace_root, PathBuf::from("/tmp/ws"));
    }
}
