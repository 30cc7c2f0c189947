use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// What the matchmaking core needs to know about an account.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub banned: bool,
}

/// External user-account service, consulted before admitting a user to the
/// queue. Account management itself lives outside this server.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `Ok(None)` means the user does not exist.
    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>>;
}

/// HTTP-backed directory: `GET {base}/users/{id}` returning `{"banned": bool}`.
pub struct HttpUserDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUserDirectory {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let url = format!("{}/users/{}", self.base_url, user_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("user directory request failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = response
            .error_for_status()
            .context("user directory returned an error")?
            .json::<UserRecord>()
            .await
            .context("user directory returned malformed body")?;
        Ok(Some(record))
    }
}

/// Used when no directory is configured: every id resolves to an unbanned
/// account. Suitable for single-node and development deployments.
pub struct PermissiveDirectory;

#[async_trait]
impl UserDirectory for PermissiveDirectory {
    async fn find_user(&self, _user_id: &str) -> Result<Option<UserRecord>> {
        Ok(Some(UserRecord { banned: false }))
    }
}
