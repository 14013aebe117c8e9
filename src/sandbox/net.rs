//! Host network provisioning for sandbox VMs — launcher phase 4.
//!
//! Each slot (`sandbox::slots::VmSlot`) carries a dedicated TAP device and a
//! static host/guest IP pair. This module wires the TAP into the host's
//! network stack and installs the iptables allowlist that lets the guest
//! reach the host's DNS resolver and HTTP proxy and nothing else — the same
//! policy `guest-netcheck` proves is intact from inside the VM. Grounded on
//! the teacher's `sandbox/firecracker/net.rs` (`setup_tap`/`setup_nat`),
//! generalized from "allow everything via NAT" to the allow/deny policy this
//! spec requires.

use tokio::process::Command;

use crate::error::{Result, SandboxError};
use crate::sandbox::slots::VmSlot;

/// Host port the DNS resolver listens on for guest queries.
const DNS_PORT: u16 = 53;
/// Host port the HTTP forward proxy listens on for guest requests.
const PROXY_PORT: u16 = 8888;
/// Cloud metadata address the guest must never be able to reach.
const METADATA_IP: &str = "169.254.169.254";

async fn run_privileged(bin: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(bin)
        .args(args)
        .status()
        .await
        .map_err(|err| SandboxError::Internal(format!("failed to run {bin} {args:?}: {err}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(SandboxError::Internal(format!("{bin} {args:?} exited with {status}")))
    }
}

async fn run_ip(args: &[&str]) -> Result<()> {
    run_privileged("ip", args).await
}

/// Creates the slot's TAP device, assigns its host IP, brings the link up,
/// and installs the egress allowlist. A stale TAP from a crashed prior run
/// is deleted first, matching the teacher's idempotent `setup_tap`.
pub async fn setup(slot: &VmSlot) -> Result<()> {
    let _ = run_ip(&["link", "del", &slot.tap_name]).await;

    run_ip(&["tuntap", "add", "dev", &slot.tap_name, "mode", "tap"]).await?;
    run_ip(&[
        "addr",
        "add",
        &format!("{}{}", slot.host_ip, slot.mask_short),
        "dev",
        &slot.tap_name,
    ])
    .await?;
    run_ip(&["link", "set", "dev", &slot.tap_name, "up"]).await?;

    install_egress_rules(slot).await
}

/// Installs the per-slot `FORWARD` rules: accept guest→host DNS and proxy
/// traffic, explicitly reject the metadata address, then reject everything
/// else from this guest. Rules are inserted (`-I`) so they sit ahead of any
/// other slot's catch-all reject.
async fn install_egress_rules(slot: &VmSlot) -> Result<()> {
    let guest = slot.guest_ip.as_str();
    let host = slot.host_ip.as_str();

    for port in [DNS_PORT, PROXY_PORT] {
        for proto in ["tcp", "udp"] {
            run_privileged(
                "iptables",
                &[
                    "-I",
                    "FORWARD",
                    "-s",
                    guest,
                    "-d",
                    host,
                    "-p",
                    proto,
                    "--dport",
                    &port.to_string(),
                    "-j",
                    "ACCEPT",
                ],
            )
            .await?;
        }
    }

    run_privileged(
        "iptables",
        &["-I", "FORWARD", "-s", guest, "-d", METADATA_IP, "-j", "REJECT"],
    )
    .await?;

    run_privileged("iptables", &["-A", "FORWARD", "-s", guest, "-j", "REJECT"]).await
}

async fn remove_egress_rules(slot: &VmSlot) {
    let guest = slot.guest_ip.as_str();
    let host = slot.host_ip.as_str();

    let _ = run_privileged("iptables", &["-D", "FORWARD", "-s", guest, "-j", "REJECT"]).await;
    let _ = run_privileged(
        "iptables",
        &["-D", "FORWARD", "-s", guest, "-d", METADATA_IP, "-j", "REJECT"],
    )
    .await;
    for port in [DNS_PORT, PROXY_PORT] {
        for proto in ["tcp", "udp"] {
            let _ = run_privileged(
                "iptables",
                &[
                    "-D",
                    "FORWARD",
                    "-s",
                    guest,
                    "-d",
                    host,
                    "-p",
                    proto,
                    "--dport",
                    &port.to_string(),
                    "-j",
                    "ACCEPT",
                ],
            )
            .await;
        }
    }
}

/// Deletes the TAP device and its iptables rules. Safe to call more than
/// once: a missing TAP or an already-removed rule is swallowed, matching the
/// teardown-idempotence property tested in spec §8.
pub async fn teardown(slot: &VmSlot) {
    remove_egress_rules(slot).await;
    let _ = run_ip(&["link", "del", &slot.tap_name]).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_and_proxy_ports_match_spec() {
        assert_eq!(DNS_PORT, 53);
        assert_eq!(PROXY_PORT, 8888);
        assert_eq!(METADATA_IP, "169.254.169.254");
    }
}
