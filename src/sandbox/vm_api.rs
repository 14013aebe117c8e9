//! Firecracker REST API client — launcher phase 5 (VM configuration and
//! boot), speaking to the jailed Firecracker's Unix control socket.
//!
//! Firecracker never exposes its API over TCP; every request goes out over
//! the per-VM Unix socket via `curl --unix-socket`, the same transport the
//! teacher's `sandbox/firecracker/vm_api.rs` uses for its `UnixSocket`
//! variant (narrowed here to local-host only — this service is single-host
//! per spec's Non-goals, so the teacher's Lima/SSH transport doesn't apply).

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::{Result, SandboxError};

pub struct FirecrackerApi {
    socket_path: PathBuf,
}

/// Everything needed to bring a jailed Firecracker process from "socket
/// exists" to "guest kernel running", matching the teacher's
/// `VmBootConfig` + `VmNetworkConfig` shape collapsed into one struct since
/// this service only ever configures a single rootfs drive and NIC.
pub struct BootConfig<'a> {
    pub kernel_image_path: &'a Path,
    pub boot_args: String,
    pub rootfs_path: &'a Path,
    pub tap_name: &'a str,
    pub guest_mac: &'a str,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
}

impl FirecrackerApi {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn put(&self, endpoint: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("http://localhost{endpoint}");
        let output = Command::new("curl")
            .args([
                "--unix-socket",
                &self.socket_path.to_string_lossy(),
                "-s",
                "-w",
                "\n%{http_code}",
                "-X",
                "PUT",
                "-H",
                "Content-Type: application/json",
                "-d",
                &body.to_string(),
                &url,
            ])
            .output()
            .await
            .map_err(|err| SandboxError::Internal(format!("curl PUT {endpoint} failed to spawn: {err}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines: Vec<&str> = stdout.lines().collect();
        let status_code = lines.pop().unwrap_or("000");
        let body_text = lines.join("\n");

        match status_code.parse::<u16>() {
            Ok(code) if (200..300).contains(&code) => Ok(()),
            _ => Err(SandboxError::Internal(format!(
                "firecracker API PUT {endpoint} returned {status_code}: {body_text}"
            ))),
        }
    }

    pub async fn set_machine_config(&self, vcpu_count: u8, mem_size_mib: u32) -> Result<()> {
        self.put(
            "/machine-config",
            serde_json::json!({
                "vcpu_count": vcpu_count,
                "mem_size_mib": mem_size_mib,
                "smt": false,
            }),
        )
        .await
    }

    pub async fn set_boot_source(&self, kernel_image_path: &Path, boot_args: &str) -> Result<()> {
        self.put(
            "/boot-source",
            serde_json::json!({
                "kernel_image_path": kernel_image_path.to_string_lossy(),
                "boot_args": boot_args,
            }),
        )
        .await
    }

    pub async fn set_rootfs(&self, rootfs_path: &Path) -> Result<()> {
        self.put(
            "/drives/rootfs",
            serde_json::json!({
                "drive_id": "rootfs",
                "path_on_host": rootfs_path.to_string_lossy(),
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await
    }

    pub async fn set_network_interface(&self, tap_name: &str, guest_mac: &str) -> Result<()> {
        self.put(
            "/network-interfaces/eth0",
            serde_json::json!({
                "iface_id": "eth0",
                "guest_mac": guest_mac,
                "host_dev_name": tap_name,
            }),
        )
        .await
    }

    pub async fn start_instance(&self) -> Result<()> {
        self.put("/actions", serde_json::json!({ "action_type": "InstanceStart" })).await
    }

    /// Fully configures and boots a VM: machine-config, boot-source, rootfs
    /// drive, network interface, then `InstanceStart` — the same
    /// sequencing as the teacher's `configure_and_boot`.
    pub async fn configure_and_boot(&self, config: &BootConfig<'_>) -> Result<()> {
        self.set_machine_config(config.vcpu_count, config.mem_size_mib).await?;
        self.set_boot_source(config.kernel_image_path, &config.boot_args).await?;
        self.set_rootfs(config.rootfs_path).await?;
        self.set_network_interface(config.tap_name, config.guest_mac).await?;
        self.start_instance().await
    }
}

/// Builds the guest kernel command line implementing component-design phase
/// 5: static guest IP, default route to the host, and console verbosity
/// toggled by the job's cosmetic `quiet_kernel` flag (spec §3).
pub fn build_boot_args(guest_ip: &str, host_ip: &str, quiet_kernel: bool) -> String {
    let console = if quiet_kernel {
        "console=ttyS0 quiet loglevel=0"
    } else {
        "console=ttyS0"
    };
    format!(
        "{console} reboot=k panic=1 i8042.noaux i8042.nomux i8042.nopnp i8042.dumbkbd \
         ip={guest_ip}::{host_ip}:255.255.255.252::eth0:off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_args_carry_static_guest_network() {
        let args = build_boot_args("172.16.0.2", "172.16.0.1", true);
        assert!(args.contains("ip=172.16.0.2::172.16.0.1:255.255.255.252::eth0:off"));
    }

    #[test]
    fn quiet_kernel_toggles_console_verbosity() {
        let quiet = build_boot_args("172.16.0.2", "172.16.0.1", true);
        let loud = build_boot_args("172.16.0.2", "172.16.0.1", false);
        assert!(quiet.contains("quiet"));
        assert!(!loud.contains("quiet"));
    }
}
