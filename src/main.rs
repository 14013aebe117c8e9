use std::path::PathBuf;
use std::sync::Arc;

use acore_sandbox::api::{self, AppState};
use acore_sandbox::config::Config;
use acore_sandbox::credentials::{self, CredentialProvider, StaticCredentialProvider};
use acore_sandbox::queue::{JobQueue, JobQueueLayout};
use acore_sandbox::sandbox::launcher::{LauncherConfig, SandboxLauncher};
use acore_sandbox::sandbox::slots::SlotAllocator;
use acore_sandbox::sandbox::types::SandboxSpec;
use acore_sandbox::service::Service;
use acore_sandbox::worker_pool::WorkerPool;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "acore-sandbox", about = "Sandboxed task validation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server (default when no subcommand is given).
    Serve,
    /// Run one or more sandbox jobs directly, without the HTTP surface.
    Run {
        #[arg(long, default_value_t = 2)]
        workers: usize,
        #[arg(long)]
        workspace_dir: Option<PathBuf>,
        #[arg(long)]
        workspace_zip: Option<PathBuf>,
        #[arg(long)]
        creds_file: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        jobs: usize,
        #[arg(long, default_value_t = 120)]
        timeout_s: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("acore_sandbox=info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli { command: Some(Command::Serve) }
    } else {
        Cli::parse()
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Run {
            workers,
            workspace_dir,
            workspace_zip,
            creds_file,
            jobs,
            timeout_s,
        } => run_cli(workers, workspace_dir, workspace_zip, creds_file, jobs, timeout_s).await,
    }
}

fn build_launcher(config: &Config) -> Arc<SandboxLauncher> {
    let slots = Arc::new(SlotAllocator::new(0, 10_000));
    let launcher_config = LauncherConfig {
        workspace_root: config.workspace_root.clone(),
        firecracker_bin: config.firecracker_bin.clone(),
        jailer_bin: config.jailer_bin.clone(),
        kernel_image: config.kernel_image.clone(),
        rootfs_base_image: config.rootfs_base_image.clone(),
        chroot_base: config.workspace_root.join("jailer"),
        guest_ssh_key: config.guest_ssh_key.clone(),
    };
    Arc::new(SandboxLauncher::new(launcher_config, slots))
}

async fn serve() -> Result<()> {
    let config = Config::from_env();

    let credential_provider = credentials::from_env()
        .await
        .context("failed to initialize credential provider")?;

    let launcher = build_launcher(&config);
    let pool = Arc::new(WorkerPool::new(config.max_workers, launcher, credential_provider.clone()));

    let layout = JobQueueLayout {
        log_dir: config.log_dir.clone(),
        archive_root: config.archive_root.clone(),
    };
    let queue = JobQueue::new(config.queue_capacity, layout);

    let service = Service::new(queue, pool, credential_provider);
    service.spawn_dispatch_loop();

    let archive_root = Some(config.archive_root.clone());

    let state = AppState {
        service,
        config: Arc::new(config),
        archive_root,
    };

    let app = api::create_app(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!(addr = %addr, "starting sandbox validation service");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_cli(
    workers: usize,
    workspace_dir: Option<PathBuf>,
    workspace_zip: Option<PathBuf>,
    creds_file: Option<PathBuf>,
    jobs: usize,
    timeout_s: u64,
) -> Result<()> {
    if workspace_dir.is_some() == workspace_zip.is_some() {
        anyhow::bail!("provide exactly one of --workspace-dir or --workspace-zip");
    }

    let token = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
        .context("GOOGLE_OAUTH_ACCESS_TOKEN must be set")?;

    let credential_provider: Arc<dyn CredentialProvider> = if let Some(creds_file) = creds_file {
        Arc::new(
            acore_sandbox::credentials::GcpCredentialProvider::start(creds_file, 300)
                .await
                .context("failed to start GCP credential provider")?,
        )
    } else {
        Arc::new(StaticCredentialProvider::new(token))
    };

    let config = Config::from_env();
    let launcher = build_launcher(&config);
    let pool = WorkerPool::new(workers.max(1), launcher, credential_provider);

    let mut handles = Vec::with_capacity(jobs);
    for i in 0..jobs.max(1) {
        let spec = SandboxSpec {
            job_id: format!("job-{i}"),
            task_id: String::new(),
            miner_uid: None,
            workspace_zip: workspace_zip.clone(),
            workspace_dir: workspace_dir.clone(),
            task_json: serde_json::json!({}),
            timeout_s,
            net_checks: false,
            quiet_kernel: true,
        };
        handles.push(spec);
    }

    let pool = Arc::new(pool);
    let mut tasks = Vec::with_capacity(handles.len());
    for spec in handles {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move { pool.run(spec).await }));
    }

    let mut exit_code = 0;
    for task in tasks {
        match task.await {
            Ok(Ok(result)) => {
                println!(
                    "[{}] status={:?} score={} msg={}",
                    result.job_id,
                    result.status,
                    result.score,
                    result.msg.as_deref().unwrap_or("")
                );
                if result.status != acore_sandbox::sandbox::types::JobStatus::Pass {
                    exit_code = 1;
                }
            }
            Ok(Err(err)) => {
                eprintln!("job failed before producing a result: {err}");
                exit_code = 1;
            }
            Err(err) => {
                eprintln!("job task panicked: {err}");
                exit_code = 1;
            }
        }
    }

    if exit_code != 0 {
        anyhow::bail!("one or more jobs failed");
    }
    Ok(())
}
