//! Security Command Center IaC validation
//!
//! Submits a Terraform plan to the Security Posture API, waits for the
//! long-running operation to finish and turns its report into a run-task
//! result.
//!
//! - [`retry`] - retry policy shared by every call to the validation API
//! - [`client`] - report submission and operation status checks
//! - [`poller`] - completion polling with heartbeat callbacks
//! - [`report`] - report to task-result transformation

pub mod client;
pub mod poller;
pub mod report;
pub mod retry;

use std::time::Duration;

use thiserror::Error;

pub use client::{JobHandle, OperationSource, OperationStatus, SecurityPostureClient};
pub use poller::{OperationPoller, PollConfig};
pub use report::{
    transform_report, Outcome, Severity, SeverityCounts, TaskResultDocument, TaskResultStatus,
    TransformError,
};
pub use retry::{RetryPolicy, RetryingClient};

/// Failures talking to the validation API or waiting on its operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The request never produced an HTTP response.
    #[error("Error calling {context}: {message}")]
    Transport {
        context: &'static str,
        message: String,
    },

    /// Non-retryable HTTP error status.
    #[error("Error calling {context}: HTTP {status}: {message}")]
    Remote {
        context: &'static str,
        status: u16,
        message: String,
    },

    #[error("All retries failed for {context} call.")]
    RetriesExhausted {
        context: &'static str,
        attempts: usize,
        last_status: u16,
    },

    #[error("Malformed response from {context}: {message}")]
    MalformedResponse {
        context: &'static str,
        message: String,
    },

    /// The operation finished with an error instead of a report.
    #[error("IaC validation operation failed: {0}")]
    OperationFailed(String),

    /// A "running" heartbeat could not be delivered.
    #[error("Error sending callback request")]
    Heartbeat { status: u16 },

    #[error("Polling cancelled before the validation operation finished")]
    Cancelled,

    #[error("IaC validation operation did not finish within {0:?}")]
    PollTimeout(Duration),
}

impl ValidationError {
    /// HTTP status to report to the run-task caller.
    pub fn status_code(&self) -> u16 {
        match self {
            ValidationError::Remote { status, .. } => *status,
            ValidationError::Heartbeat { status } => *status,
            ValidationError::Cancelled => 503,
            ValidationError::PollTimeout(_) => 504,
            ValidationError::Transport { .. }
            | ValidationError::RetriesExhausted { .. }
            | ValidationError::MalformedResponse { .. }
            | ValidationError::OperationFailed(_) => 500,
        }
    }
}
