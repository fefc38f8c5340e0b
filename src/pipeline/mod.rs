//! Run-task request orchestration.
//!
//! One inbound webhook is handled end to end here:
//!
//! 1. signature header and body fields are present
//! 2. `stage == "test"` returns immediately
//! 3. Google credentials, project number and owning organization
//! 4. HMAC signature check against the key stored in that project
//! 5. plan download
//! 6. validation submit, then poll with heartbeats
//! 7. report transformation and final callback
//!
//! Any failed step ends the request with that step's status and message.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::callback::{CallbackDispatcher, ResultSink};
use crate::gcp::{CollaboratorError, CredentialSource, ProjectDirectory, SecretStore};
use crate::hooks::auth::{authenticate, extract_signature, DEFAULT_SIGNATURE_HEADER};
use crate::hooks::request::{parse_run_task_request, RunTaskRequest};
use crate::plan::{PlanFetchError, PlanSource};
use crate::validation::report::DEFAULT_REPORT_HOST;
use crate::validation::{
    transform_report, OperationPoller, PollConfig, SecurityPostureClient, TaskResultStatus,
    TransformError, ValidationError,
};

/// Everything outside the gate the pipeline depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialSource>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub secrets: Arc<dyn SecretStore>,
    pub plans: Arc<dyn PlanSource>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Header carrying the HMAC-SHA512 body signature.
    pub signature_header: String,
    pub poll: PollConfig,
    /// Host used in the report URL shown in Terraform.
    pub report_host: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            poll: PollConfig::default(),
            report_host: DEFAULT_REPORT_HOST.to_string(),
        }
    }
}

/// How a request that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTaskOutcome {
    /// Terraform's connectivity check; nothing was done.
    TestStage,
    /// The final result was delivered.
    Completed {
        result: TaskResultStatus,
        callback_status: u16,
    },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid HMAC signature")]
    Unauthorized,

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    PlanFetch(#[from] PlanFetchError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Error sending final callback")]
    FinalCallback { status: u16 },
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        let code = match self {
            PipelineError::BadRequest(_) => 400,
            PipelineError::Unauthorized => 401,
            PipelineError::Collaborator(_) | PipelineError::Transform(_) => 500,
            PipelineError::PlanFetch(e) => e.status,
            PipelineError::Validation(e) => e.status_code(),
            PipelineError::FinalCallback { status } => *status,
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

pub struct RunTaskPipeline {
    collaborators: Collaborators,
    validation: SecurityPostureClient,
    callback_client: reqwest::Client,
    config: PipelineConfig,
}

impl RunTaskPipeline {
    pub fn new(
        collaborators: Collaborators,
        validation: SecurityPostureClient,
        callback_client: reqwest::Client,
        config: PipelineConfig,
    ) -> Self {
        Self {
            collaborators,
            validation,
            callback_client,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Check the signature header and body fields. Returns `None` for the
    /// test stage, otherwise the request and its claimed signature.
    fn admit(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Option<(RunTaskRequest, String)>, PipelineError> {
        let signature = extract_signature(headers, &self.config.signature_header)
            .ok_or_else(|| {
                PipelineError::BadRequest(format!(
                    "Missing header field: {}",
                    self.config.signature_header
                ))
            })?
            .to_string();
        let request = parse_run_task_request(body).map_err(PipelineError::BadRequest)?;

        if request.stage.is_test() {
            info!(target: "http", "test stage request, nothing to validate");
            return Ok(None);
        }
        Ok(Some((request, signature)))
    }

    pub async fn run(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        cancel: CancellationToken,
    ) -> Result<RunTaskOutcome, PipelineError> {
        let Some((request, signature)) = self.admit(headers, body)? else {
            return Ok(RunTaskOutcome::TestStage);
        };

        let creds = self.collaborators.credentials.credentials().await?;
        let project_number = self.collaborators.projects.project_number(&creds).await?;
        let org_id = self.collaborators.projects.organization_id(&creds).await?;

        let authenticated = authenticate(
            body,
            Some(&signature),
            self.collaborators.secrets.as_ref(),
            &project_number,
            &creds,
        )
        .await;
        if !authenticated {
            return Err(PipelineError::Unauthorized);
        }

        info!(
            target: "validation",
            organization = %request.organization_name,
            stage = ?request.stage,
            "starting IaC validation"
        );

        let plan = self
            .collaborators
            .plans
            .fetch_plan(&request.plan_json_api_url, &request.access_token)
            .await?;

        let callback = CallbackDispatcher::new(
            self.callback_client.clone(),
            &request.task_result_callback_url,
            &request.access_token,
        );

        let handle = self.validation.submit(&plan, &org_id, &creds).await?;
        let operations = self.validation.operations(&creds);
        let payload = OperationPoller::new(&operations, &callback, self.config.poll)
            .poll(&handle, &cancel)
            .await?;

        let document = transform_report(&payload, &self.config.report_host)?;
        let callback_status = callback.deliver(&document).await;
        if callback_status != 200 {
            error!(target: "callback", status = callback_status, "Error sending final callback");
            return Err(PipelineError::FinalCallback {
                status: callback_status,
            });
        }

        info!(
            target: "validation",
            result = ?document.status,
            summary = %document.message,
            "run task completed"
        );
        Ok(RunTaskOutcome::Completed {
            result: document.status,
            callback_status,
        })
    }
}
