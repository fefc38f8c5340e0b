//! Completion polling for validation operations.
//!
//! Each round sends a "running" heartbeat, checks the operation once and,
//! if it is still pending, sleeps for the configured interval. The loop
//! never checks the operation without first having reported progress.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::client::{JobHandle, OperationSource, OperationStatus};
use super::report::TaskResultDocument;
use super::ValidationError;
use crate::callback::ResultSink;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Upper bound on the whole loop; `None` waits for as long as it takes.
    pub max_duration: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_duration: None,
        }
    }
}

pub struct OperationPoller<'a> {
    operations: &'a dyn OperationSource,
    heartbeat: &'a dyn ResultSink,
    config: PollConfig,
}

impl<'a> OperationPoller<'a> {
    pub fn new(
        operations: &'a dyn OperationSource,
        heartbeat: &'a dyn ResultSink,
        config: PollConfig,
    ) -> Self {
        Self {
            operations,
            heartbeat,
            config,
        }
    }

    /// Wait for `handle` to finish and return its `response` payload.
    pub async fn poll(
        &self,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<Value, ValidationError> {
        let deadline = self.config.max_duration.map(|d| Instant::now() + d);
        let running = TaskResultDocument::running();
        let mut round = 0u64;

        loop {
            round += 1;
            if cancel.is_cancelled() {
                return Err(ValidationError::Cancelled);
            }

            let status = self.heartbeat.deliver(&running).await;
            if status != 200 {
                error!(target: "validation", status, "Error sending callback request");
                return Err(ValidationError::Heartbeat { status });
            }

            match self.operations.check_operation(handle).await? {
                OperationStatus::Done(payload) => {
                    info!(target: "validation", operation = %handle, round, "validation operation finished");
                    return Ok(payload);
                }
                OperationStatus::Failed(message) => {
                    error!(target: "validation", operation = %handle, "validation operation failed: {}", message);
                    return Err(ValidationError::OperationFailed(message));
                }
                OperationStatus::Pending => {
                    debug!(target: "validation", operation = %handle, round, "operation still running");
                }
            }

            let wake = Instant::now() + self.config.interval;
            if let (Some(deadline), Some(max)) = (deadline, self.config.max_duration) {
                if wake > deadline {
                    return Err(ValidationError::PollTimeout(max));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ValidationError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
