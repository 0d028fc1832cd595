//! Credential providers.

use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::RwLock;

/// Supplies credentials for remote requests.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Returns headers to attach to every request. Empty when there is no
    /// credential.
    async fn auth_headers(&self) -> SyncResult<Vec<(String, String)>>;

    /// Returns true if a credential is cached locally, even if it may have
    /// expired.
    fn has_cached_credential(&self) -> bool;

    /// Reacts to a 401/403. Returns true if the credential was refreshed and
    /// the request should be retried once.
    async fn handle_auth_error(&self, status: u16) -> bool;
}

/// A provider for remotes that need no credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn auth_headers(&self) -> SyncResult<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    fn has_cached_credential(&self) -> bool {
        false
    }

    async fn handle_auth_error(&self, _status: u16) -> bool {
        false
    }
}

/// A bearer-token provider with an optional one-shot refresh token.
#[derive(Debug, Default)]
pub struct StaticAuth {
    token: RwLock<Option<String>>,
    refresh: RwLock<Option<String>>,
}

impl StaticAuth {
    /// Creates a provider holding `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            refresh: RwLock::new(None),
        }
    }

    /// Creates a provider without a credential.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Sets the token that replaces the current one on the next auth error.
    pub fn with_refresh(self, token: impl Into<String>) -> Self {
        *self.refresh.write() = Some(token.into());
        self
    }

    /// Replaces the current token.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Returns the current token.
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn auth_headers(&self) -> SyncResult<Vec<(String, String)>> {
        Ok(self
            .token
            .read()
            .as_ref()
            .map(|token| vec![("authorization".to_string(), format!("Bearer {token}"))])
            .unwrap_or_default())
    }

    fn has_cached_credential(&self) -> bool {
        self.token.read().is_some()
    }

    async fn handle_auth_error(&self, status: u16) -> bool {
        let refreshed = self.refresh.write().take();
        match refreshed {
            Some(token) => {
                tracing::debug!(status, "refreshed credential after auth error");
                *self.token.write() = Some(token);
                true
            }
            None => false,
        }
    }
}
