//! Credentials from the GCE/Cloud Run metadata server.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use super::{CollaboratorError, CredentialSource, GcpCredentials};

/// Metadata server root.
pub const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

/// Refresh tokens this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedCredentials {
    creds: GcpCredentials,
    expires_at: Instant,
}

/// Default service-account credentials read from the metadata server.
pub struct MetadataCredentials {
    client: reqwest::Client,
    base_url: String,
    cache: Mutex<Option<CachedCredentials>>,
}

impl MetadataCredentials {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: DEFAULT_METADATA_URL.to_string(),
            cache: Mutex::new(None),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, CollaboratorError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| CollaboratorError::Credentials(format!("metadata request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CollaboratorError::Credentials(format!(
                "metadata request {} failed (status={})",
                path,
                response.status()
            )));
        }
        Ok(response)
    }

    async fn fetch(&self) -> Result<CachedCredentials, CollaboratorError> {
        let token: TokenResponse = self
            .get("instance/service-accounts/default/token")
            .await?
            .json()
            .await
            .map_err(|e| CollaboratorError::Credentials(format!("invalid token response: {e}")))?;

        let project_id = self
            .get("project/project-id")
            .await?
            .text()
            .await
            .map_err(|e| CollaboratorError::Credentials(format!("project id read failed: {e}")))?
            .trim()
            .to_string();

        if token.access_token.is_empty() {
            return Err(CollaboratorError::Credentials(
                "metadata server returned an empty token".to_string(),
            ));
        }
        if project_id.is_empty() {
            return Err(CollaboratorError::Credentials(
                "Failed to fetch project ID".to_string(),
            ));
        }

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
        debug!(target: "gcp", project_id = %project_id, "refreshed metadata credentials");

        Ok(CachedCredentials {
            creds: GcpCredentials {
                access_token: token.access_token,
                project_id,
            },
            expires_at: Instant::now() + lifetime,
        })
    }
}

#[async_trait]
impl CredentialSource for MetadataCredentials {
    async fn credentials(&self) -> Result<GcpCredentials, CollaboratorError> {
        let cached = self
            .cache
            .lock()
            .as_ref()
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.creds.clone());
        if let Some(creds) = cached {
            return Ok(creds);
        }

        let fresh = self.fetch().await?;
        let creds = fresh.creds.clone();
        *self.cache.lock() = Some(fresh);
        Ok(creds)
    }
}
