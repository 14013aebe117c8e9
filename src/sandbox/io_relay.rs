//! Redacted stdout/stderr relay — launcher phase 6.
//!
//! Two short-lived tokio tasks per launched VM read the child's stdout and
//! stderr, redact any configured secret, append to a bounded tail buffer,
//! and write through to the per-job log file.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::redact::redact_str;
use crate::sandbox::types::TailBuffer;

const TAIL_CAPACITY: usize = 200;

/// Shared tail buffer fed by both the stdout and stderr relay tasks.
#[derive(Clone)]
pub struct SharedTail {
    inner: Arc<Mutex<TailBuffer>>,
}

impl SharedTail {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TailBuffer::new(TAIL_CAPACITY))),
        }
    }

    pub fn push(&self, line: String) {
        self.inner.lock().unwrap().push(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().unwrap().clone().into_vec()
    }
}

impl Default for SharedTail {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a relay task reading lines from `stream`, redacting `secret` from
/// each line, appending to `tail`, and writing through to the log file at
/// `log_path` (best-effort — failures to open/write the log never fail the
/// relay itself, matching the original's best-effort log-file handling).
pub fn spawn_relay<R>(stream: R, tail: SharedTail, secret: Option<String>, log_path: Option<std::path::PathBuf>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut log_file = match &log_path {
            Some(path) => open_log_file(path).await.ok(),
            None => None,
        };

        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let redacted = redact_str(&line, secret.as_deref());
            if let Some(file) = log_file.as_mut() {
                use tokio::io::AsyncWriteExt;
                let _ = file.write_all(redacted.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
                let _ = file.flush().await;
            }
            tail.push(redacted);
        }
    })
}

async fn open_log_file(path: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }
    Ok(file)
}
