use std::path::PathBuf;

/// Service configuration loaded from environment variables.
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub max_workers: usize,
    pub workspace_root: PathBuf,
    pub archive_root: PathBuf,
    pub firecracker_bin: PathBuf,
    pub jailer_bin: PathBuf,
    pub kernel_image: PathBuf,
    pub rootfs_base_image: PathBuf,
    pub guest_ssh_key: PathBuf,
    pub job_timeout_s: u64,
    pub await_timeout_grace_s: u64,
    pub queue_capacity: usize,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("PORT").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("ACORE_MAX_WORKERS").ok().as_deref(),
            std::env::var("ACORE_WORKSPACE_ROOT").ok().as_deref(),
            std::env::var("ACORE_ARCHIVE_ROOT").ok().as_deref(),
            std::env::var("ACORE_FIRECRACKER_BIN").ok().as_deref(),
            std::env::var("ACORE_JAILER_BIN").ok().as_deref(),
            std::env::var("ACORE_KERNEL_IMAGE").ok().as_deref(),
            std::env::var("ACORE_ROOTFS_IMAGE").ok().as_deref(),
            std::env::var("ACORE_GUEST_SSH_KEY").ok().as_deref(),
            std::env::var("ACORE_JOB_TIMEOUT_S").ok().as_deref(),
            std::env::var("ACORE_QUEUE_CAPACITY").ok().as_deref(),
            std::env::var("ACORE_LOG_DIR").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    #[allow(clippy::too_many_arguments)]
    pub fn from_raw_values(
        port: Option<&str>,
        environment: Option<&str>,
        max_workers: Option<&str>,
        workspace_root: Option<&str>,
        archive_root: Option<&str>,
        firecracker_bin: Option<&str>,
        jailer_bin: Option<&str>,
        kernel_image: Option<&str>,
        rootfs_base_image: Option<&str>,
        guest_ssh_key: Option<&str>,
        job_timeout_s: Option<&str>,
        queue_capacity: Option<&str>,
        log_dir: Option<&str>,
    ) -> Self {
        let port = port.and_then(|v| v.parse().ok()).unwrap_or(8088);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        let max_workers = max_workers
            .and_then(|v| v.parse().ok())
            .filter(|v: &usize| *v >= 1)
            .unwrap_or(2);

        let workspace_root = workspace_root
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/acore-sandbox/workspaces"));

        let archive_root = archive_root
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/acore-sandbox/submissions"));

        let firecracker_bin = firecracker_bin
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/firecracker"));

        let jailer_bin = jailer_bin
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/jailer"));

        let kernel_image = kernel_image
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/acore-sandbox/vmlinux"));

        let rootfs_base_image = rootfs_base_image
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/acore-sandbox/rootfs.ext4"));

        let guest_ssh_key = guest_ssh_key
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/acore-sandbox/guest_ssh_key"));

        let job_timeout_s = job_timeout_s.and_then(|v| v.parse().ok()).unwrap_or(120);

        let queue_capacity = queue_capacity.and_then(|v| v.parse().ok()).unwrap_or(64);

        let log_dir = log_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/acore-sandbox/logs"));

        Config {
            port,
            environment,
            max_workers,
            workspace_root,
            archive_root,
            firecracker_bin,
            jailer_bin,
            kernel_image,
            rootfs_base_image,
            guest_ssh_key,
            job_timeout_s,
            await_timeout_grace_s: 30,
            queue_capacity,
            log_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_port_uses_default() {
        let config = Config::from_raw_values(
            Some("not-a-number"),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        );
        assert_eq!(config.port, 8088);
    }

    #[test]
    fn valid_port() {
        let config = Config::from_raw_values(
            Some("3000"),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        );
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn zero_workers_falls_back_to_default() {
        let config = Config::from_raw_values(
            None, None, Some("0"), None, None, None, None, None, None, None, None, None, None,
        );
        assert_eq!(config.max_workers, 2);
    }

    #[test]
    fn default_environment() {
        let config = Config::from_raw_values(
            None, None, None, None, None, None, None, None, None, None, None, None, None,
        );
        assert_eq!(config.environment, "local");
    }

    #[test]
    fn custom_max_workers() {
        let config = Config::from_raw_values(
            None,
            None,
            Some("8"),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        );
        assert_eq!(config.max_workers, 8);
    }
}
