//! Google Cloud collaborators
//!
//! The pipeline only depends on the traits in this module:
//! - [`CredentialSource`] - short-lived OAuth2 token and project id
//! - [`ProjectDirectory`] - project number and owning organization
//! - [`SecretStore`] - the run-task HMAC key
//!
//! Production implementations talk to the metadata server, Resource Manager
//! and Secret Manager over REST.

pub mod metadata;
pub mod resource_manager;
pub mod secret_manager;

use async_trait::async_trait;
use thiserror::Error;

pub use metadata::MetadataCredentials;
pub use resource_manager::ResourceManagerClient;
pub use secret_manager::{SecretManagerStore, StaticSecretStore};

/// Name of the secret holding the run-task HMAC key.
pub const DEFAULT_HMAC_SECRET_NAME: &str = "HCP_TERRAFORM_HMAC";

/// Failures of the prerequisite lookups. All map to 500.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Failed to obtain access token: {0}")]
    Credentials(String),

    #[error("Failed to fetch project number: {0}")]
    ProjectNumber(String),

    #[error("Failed to fetch organization ID: {0}")]
    Organization(String),

    #[error("Failed to read HMAC key: {0}")]
    Secret(String),
}

/// Credentials for calling Google APIs on behalf of the service.
#[derive(Clone)]
pub struct GcpCredentials {
    pub access_token: String,
    pub project_id: String,
}

impl std::fmt::Debug for GcpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpCredentials")
            .field("access_token", &"[REDACTED]")
            .field("project_id", &self.project_id)
            .finish()
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self) -> Result<GcpCredentials, CollaboratorError>;
}

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    /// Numeric project number for the credentials' project.
    async fn project_number(&self, creds: &GcpCredentials) -> Result<String, CollaboratorError>;

    /// Organization id that owns the credentials' project.
    async fn organization_id(&self, creds: &GcpCredentials) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Run-task HMAC key stored under `project_number`, read with `creds`.
    async fn hmac_key(
        &self,
        project_number: &str,
        creds: &GcpCredentials,
    ) -> Result<String, CollaboratorError>;
}
