use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const DEFAULT_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];
const MIN_REFRESH_SKEW_S: i64 = 30;
const DEFAULT_REFRESH_SKEW_S: i64 = 300;
const BACKOFF_START_S: f64 = 5.0;
const BACKOFF_CAP_S: f64 = 300.0;
const NO_EXPIRY_SLEEP_S: f64 = 1800.0;

/// Mints and refreshes the OAuth access token handed to the guest environment.
/// The worker pool and HTTP layer depend on this trait rather than on the
/// concrete GCP implementation.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self) -> crate::error::Result<String>;
}

/// A token supplied directly through the environment. Never refreshes,
/// mirroring the original's `env_token` shortcut for local debugging.
pub struct StaticCredentialProvider {
    token: String,
}

impl StaticCredentialProvider {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_token(&self) -> crate::error::Result<String> {
        Ok(self.token.clone())
    }
}

struct TokenState {
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Mints a short-lived access token from a service-account JSON key file and
/// refreshes it on a background task before it expires.
pub struct GcpCredentialProvider {
    state: Arc<RwLock<TokenState>>,
    refresh_handle: JoinHandle<()>,
}

impl GcpCredentialProvider {
    pub async fn start(creds_file: PathBuf, refresh_skew_s: i64) -> crate::error::Result<Self> {
        let refresh_skew_s = refresh_skew_s.max(MIN_REFRESH_SKEW_S);
        let account = CustomServiceAccount::from_file(&creds_file)
            .map_err(|err| crate::error::SandboxError::Internal(format!("invalid creds file: {err}")))?;
        let account = Arc::new(account);

        let state = Arc::new(RwLock::new(TokenState {
            token: None,
            expires_at: None,
            last_error: None,
        }));

        refresh_once(&account, &state).await?;

        let refresh_account = account.clone();
        let refresh_state = state.clone();
        let refresh_handle = tokio::spawn(async move {
            refresh_loop(refresh_account, refresh_state, refresh_skew_s).await;
        });

        Ok(Self {
            state,
            refresh_handle,
        })
    }
}

impl Drop for GcpCredentialProvider {
    fn drop(&mut self) {
        self.refresh_handle.abort();
    }
}

#[async_trait]
impl CredentialProvider for GcpCredentialProvider {
    async fn get_token(&self) -> crate::error::Result<String> {
        let state = self.state.read().await;
        match &state.token {
            Some(token) => Ok(token.clone()),
            None => {
                let err = state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "token not available".to_string());
                Err(crate::error::SandboxError::NotReady(err))
            }
        }
    }
}

async fn refresh_once(
    account: &Arc<CustomServiceAccount>,
    state: &Arc<RwLock<TokenState>>,
) -> crate::error::Result<()> {
    let scopes: Vec<String> = DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect();
    let token = account
        .token(&scopes.iter().map(String::as_str).collect::<Vec<_>>())
        .await
        .map_err(|err| crate::error::SandboxError::Internal(format!("token refresh failed: {err}")))?;

    let expires_at = token.expires_at().map(|t| DateTime::<Utc>::from(t));

    let mut guard = state.write().await;
    guard.token = Some(token.as_str().to_string());
    guard.expires_at = expires_at;
    guard.last_error = None;
    Ok(())
}

async fn refresh_loop(
    account: Arc<CustomServiceAccount>,
    state: Arc<RwLock<TokenState>>,
    refresh_skew_s: i64,
) {
    let mut backoff_s = BACKOFF_START_S;
    loop {
        let expires_at = state.read().await.expires_at;

        let sleep_s = match expires_at {
            None => NO_EXPIRY_SLEEP_S,
            Some(expiry) => {
                let remaining = (expiry - Utc::now()).num_milliseconds() as f64 / 1000.0;
                (remaining - refresh_skew_s as f64).max(30.0)
            }
        };

        tokio::time::sleep(Duration::from_secs_f64(sleep_s)).await;

        match refresh_once(&account, &state).await {
            Ok(()) => backoff_s = BACKOFF_START_S,
            Err(err) => {
                state.write().await.last_error = Some(err.to_string());
                tracing::warn!(error = %err, "credential refresh failed, backing off");
                tokio::time::sleep(Duration::from_secs_f64(backoff_s)).await;
                backoff_s = (backoff_s * 2.0).min(BACKOFF_CAP_S);
            }
        }
    }
}

/// Resolve a provider from the environment: an explicit token wins (useful
/// for local debugging and tests), otherwise a service-account key file is
/// required.
pub async fn from_env() -> crate::error::Result<Arc<dyn CredentialProvider>> {
    if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
        if !token.is_empty() {
            return Ok(Arc::new(StaticCredentialProvider::new(token)));
        }
    }

    let creds_file = std::env::var("ALPHACORE_GCP_CREDS_FILE").map_err(|_| {
        crate::error::SandboxError::Internal(
            "missing ALPHACORE_GCP_CREDS_FILE and GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
        )
    })?;

    let provider = GcpCredentialProvider::start(PathBuf::from(creds_file), DEFAULT_REFRESH_SKEW_S).await?;
    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_returns_configured_token() {
        let provider = StaticCredentialProvider::new("abc123".to_string());
        let token = provider.get_token().await.unwrap();
        assert_eq!(token, "abc123");
    }
}
