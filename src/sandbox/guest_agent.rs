//! Guest agent — runs commands inside a booted Firecracker microVM and
//! moves files across the host/guest boundary.
//!
//! SSH-based: the guest image carries an authorized key for the host's
//! keypair (baked into the rootfs at build time) and the host reaches it
//! over the TAP-attached static IP the slot allocator assigned. This is the
//! same mechanism production Firecracker fleets use for a directly attached
//! local guest, not a remote hop — `scp`/`ssh` against `guest_ip`, nothing
//! crossing a network boundary.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Result, SandboxError};

/// Escapes a string for safe interpolation into a remote shell command.
/// Mirrors the common `'...'` with `'\''`-escaped-embedded-quotes idiom;
/// strings made up only of filename-safe characters are left bare for
/// readability in logs.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b'/') {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Result of a command executed inside the guest.
pub struct GuestExec {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// SSH/scp-based channel to a single guest VM, scoped to one job's slot.
pub struct GuestAgent {
    guest_ip: String,
    ssh_key_path: std::path::PathBuf,
    ssh_user: String,
    connect_timeout: Duration,
}

impl GuestAgent {
    pub fn new(guest_ip: String, ssh_key_path: std::path::PathBuf) -> Self {
        Self {
            guest_ip,
            ssh_key_path,
            ssh_user: "root".to_string(),
            connect_timeout: Duration::from_secs(3),
        }
    }

    fn ssh_base_args(&self) -> Vec<String> {
        vec![
            "-i".into(),
            self.ssh_key_path.to_string_lossy().into_owned(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".into(),
            "LogLevel=ERROR".into(),
            format!("{}@{}", self.ssh_user, self.guest_ip),
        ]
    }

    fn scp_base_args(&self) -> Vec<String> {
        vec![
            "-i".into(),
            self.ssh_key_path.to_string_lossy().into_owned(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
        ]
    }

    /// Polls `health_check` until it succeeds or `timeout` elapses.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        loop {
            if self.health_check().await.is_ok() {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(SandboxError::Internal(format!(
                    "guest SSH at {} never became reachable within {:?}",
                    self.guest_ip, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn health_check(&self) -> Result<()> {
        let mut args = self.ssh_base_args();
        args.push("true".into());
        let output = Command::new("ssh")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Internal(format!(
                "guest SSH health check failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    /// Runs a remote command with an env prefix, streaming nothing — the
    /// caller is expected to capture/relay `stdout`/`stderr` itself via
    /// `Command`'s own piping when it needs a live tail (see
    /// `launcher::drive_vm`, which spawns the ssh child directly rather
    /// than going through this helper when it needs to relay output).
    pub async fn exec(&self, env: &[(&str, &str)], command: &str) -> Result<GuestExec> {
        let mut args = self.ssh_base_args();
        let env_prefix = env
            .iter()
            .map(|(k, v)| format!("{}={}", shell_escape(k), shell_escape(v)))
            .collect::<Vec<_>>()
            .join(" ");
        let full_cmd = if env_prefix.is_empty() {
            command.to_string()
        } else {
            format!("{env_prefix} {command}")
        };
        args.push(full_cmd);

        let output = Command::new("ssh")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(GuestExec {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Writes `contents` to `guest_path` inside the guest without ever
    /// touching the host filesystem, by piping stdin through `ssh` into a
    /// remote `cat`. Used for the access-token file, which must never land
    /// in a host-side temp file or show up in a process argument list.
    pub async fn write_remote_file(&self, guest_path: &str, contents: &[u8], mode: &str) -> Result<()> {
        let mut args = self.ssh_base_args();
        let dir = guest_path.rsplit_once('/').map(|(d, _)| d).filter(|d| !d.is_empty());
        let mkdir = dir.map(|d| format!("mkdir -p {} && ", shell_escape(d))).unwrap_or_default();
        args.push(format!(
            "{mkdir}umask 077 && cat > {path} && chmod {mode} {path}",
            path = shell_escape(guest_path)
        ));

        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin.write_all(contents).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Internal(format!(
                "writing {guest_path} into guest failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    /// Copies a single file from the host into the guest via `scp`.
    pub async fn put_file(&self, host_path: &Path, guest_path: &str) -> Result<()> {
        let target = format!("{}@{}:{}", self.ssh_user, self.guest_ip, guest_path);
        let mut args = self.scp_base_args();
        args.push(host_path.to_string_lossy().into_owned());
        args.push(target);

        let output = Command::new("scp")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Internal(format!(
                "scp to guest failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    /// Streams a host directory tree into the guest by piping `tar` over
    /// `ssh`, rather than recursive `scp` — avoids needing `unzip` baked
    /// into the guest image and handles large workspace trees in one pass.
    pub async fn put_dir(&self, host_dir: &Path, guest_dir: &str) -> Result<()> {
        let mut tar_cmd = Command::new("tar")
            .args(["-C", &host_dir.to_string_lossy(), "-cf", "-", "."])
            .stdout(Stdio::piped())
            .spawn()?;
        let mut tar_stdout = tar_cmd.stdout.take().expect("piped tar stdout");

        let mut ssh_args = self.ssh_base_args();
        ssh_args.push(format!(
            "mkdir -p {dir} && tar -C {dir} -xf -",
            dir = shell_escape(guest_dir)
        ));
        let mut ssh_cmd = Command::new("ssh")
            .args(&ssh_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut ssh_stdin = ssh_cmd.stdin.take().expect("piped ssh stdin");

        tokio::io::copy(&mut tar_stdout, &mut ssh_stdin).await?;
        drop(ssh_stdin);

        let tar_status = tar_cmd.wait().await?;
        let ssh_output = ssh_cmd.wait_with_output().await?;

        if !tar_status.success() {
            return Err(SandboxError::Internal(format!("tar of {} failed", host_dir.display())));
        }
        if !ssh_output.status.success() {
            return Err(SandboxError::Internal(format!(
                "streaming workspace into guest failed: {}",
                String::from_utf8_lossy(&ssh_output.stderr)
            )));
        }
        Ok(())
    }

    /// Copies a single file out of the guest via `scp`.
    pub async fn get_file(&self, guest_path: &str, host_path: &Path) -> Result<()> {
        let source = format!("{}@{}:{}", self.ssh_user, self.guest_ip, guest_path);
        let mut args = self.scp_base_args();
        args.push(source);
        args.push(host_path.to_string_lossy().into_owned());

        let output = Command::new("scp")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Internal(format!(
                "scp from guest failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escape_basic() {
        assert_eq!(shell_escape("hello"), "hello");
        assert_eq!(shell_escape("hello world"), "'hello world'");
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("/usr/bin/test"), "/usr/bin/test");
    }

    #[test]
    fn shell_escape_injection_safe() {
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn ssh_base_args_carries_key_and_target() {
        let agent = GuestAgent::new("172.16.3.2".into(), "/etc/acore/guest_key".into());
        let args = agent.ssh_base_args();
        assert!(args.contains(&"/etc/acore/guest_key".to_string()));
        assert_eq!(args.last().unwrap(), "root@172.16.3.2");
    }
}
