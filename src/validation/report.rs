//! IaC validation report to run-task result transformation.
//!
//! A finished operation's `response` looks like:
//!
//! ```json
//! {
//!   "name": "organizations/1/locations/global/reports/abc",
//!   "iacValidationReport": {
//!     "violations": [
//!       {
//!         "assetId": "//compute.googleapis.com/...",
//!         "policyId": "folders/1/.../policies/p",
//!         "severity": "HIGH",
//!         "violatedPolicy": {"constraintType": "ORG_POLICY"}
//!       }
//!     ]
//!   }
//! }
//! ```
//!
//! The result is reported to Terraform as a JSON:API `task-results`
//! document with one `task-result-outcomes` entry per renderable violation.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Host used to build the report URL shown in Terraform.
pub const DEFAULT_REPORT_HOST: &str = "securityposture.googleapis.com";

/// Message sent with every heartbeat.
pub const RUNNING_MESSAGE: &str = "operation running";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResultStatus {
    Running,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRITICAL" => Some(Severity::Critical),
            "HIGH" => Some(Severity::High),
            "MEDIUM" => Some(Severity::Medium),
            "LOW" => Some(Severity::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} LOW, {} MEDIUM, {} HIGH, {} CRITICAL asset violations found",
            self.low, self.medium, self.high, self.critical
        )
    }
}

/// One rendered violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub id: String,
    pub description: String,
    pub body: String,
}

/// Interim or final run-task result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResultDocument {
    pub status: TaskResultStatus,
    pub message: String,
    pub url: Option<String>,
    /// `None` for heartbeats, which carry no relationships.
    pub outcomes: Option<Vec<Outcome>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Could not create callback request: report is not a JSON object")]
    NotAnObject,

    #[error("Could not create callback request: report has no `name`")]
    MissingName,

    #[error("Could not create callback request: report has no `iacValidationReport`")]
    MissingValidationReport,

    #[error("Could not create callback request: `violations` is not a list")]
    InvalidViolations,
}

// JSON:API wire format

/// Serializable JSON:API body borrowed from a [`TaskResultDocument`].
#[derive(Debug, Serialize)]
pub struct TaskResultEnvelope<'a> {
    data: TaskResultResource<'a>,
}

#[derive(Debug, Serialize)]
struct TaskResultResource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    attributes: TaskResultAttributes<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    relationships: Option<Relationships<'a>>,
}

#[derive(Debug, Serialize)]
struct TaskResultAttributes<'a> {
    status: TaskResultStatus,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Relationships<'a> {
    outcomes: OutcomeList<'a>,
}

#[derive(Debug, Serialize)]
struct OutcomeList<'a> {
    data: Vec<OutcomeResource<'a>>,
}

#[derive(Debug, Serialize)]
struct OutcomeResource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    attributes: OutcomeAttributes<'a>,
}

#[derive(Debug, Serialize)]
struct OutcomeAttributes<'a> {
    #[serde(rename = "outcome-id")]
    outcome_id: &'a str,
    description: &'a str,
    body: &'a str,
}

impl TaskResultDocument {
    /// Heartbeat sent while the validation operation is still running.
    pub fn running() -> Self {
        Self {
            status: TaskResultStatus::Running,
            message: RUNNING_MESSAGE.to_string(),
            url: None,
            outcomes: None,
        }
    }

    /// JSON:API callback body.
    pub fn callback_body(&self) -> TaskResultEnvelope<'_> {
        let relationships = self.outcomes.as_ref().map(|outcomes| Relationships {
            outcomes: OutcomeList {
                data: outcomes
                    .iter()
                    .map(|o| OutcomeResource {
                        kind: "task-result-outcomes",
                        attributes: OutcomeAttributes {
                            outcome_id: &o.id,
                            description: &o.description,
                            body: &o.body,
                        },
                    })
                    .collect(),
            },
        });

        TaskResultEnvelope {
            data: TaskResultResource {
                kind: "task-results",
                attributes: TaskResultAttributes {
                    status: self.status,
                    message: &self.message,
                    url: self.url.as_deref(),
                },
                relationships,
            },
        }
    }
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Markdown body shown for one outcome in Terraform.
fn outcome_body(severity: &str, asset_id: &str, policy_id: &str, constraint_type: &str) -> String {
    format!(
        "### Severity \n{} \n### Asset ID \n{} \n### Policy \n{} \n### Constraint type \n{}",
        severity, asset_id, policy_id, constraint_type
    )
}

/// Render one violation, or `None` when a required field is missing.
fn render_outcome(index: usize, violation: &Value) -> Option<Outcome> {
    let asset_id = non_empty_str(violation, "assetId")?;
    let policy_id = non_empty_str(violation, "policyId")?;
    let constraint_type = violation
        .get("violatedPolicy")
        .and_then(|p| non_empty_str(p, "constraintType"))?;
    let severity = non_empty_str(violation, "severity")?;

    Some(Outcome {
        id: format!("violation-{}", index),
        description: format!("Policy {} violated by asset {}", policy_id, asset_id),
        body: outcome_body(severity, asset_id, policy_id, constraint_type),
    })
}

/// Count severities across every violation, complete or not.
pub fn count_severities(violations: &[Value]) -> SeverityCounts {
    let mut counts = SeverityCounts::default();
    for severity in violations
        .iter()
        .filter_map(|v| v.get("severity").and_then(Value::as_str))
        .filter_map(Severity::parse)
    {
        counts.record(severity);
    }
    counts
}

/// Build the final task result for a finished validation report.
///
/// A missing or `null` `violations` passes; any list fails, even an empty
/// one. Only the top-level shape can make this fail.
pub fn transform_report(
    report: &Value,
    report_host: &str,
) -> Result<TaskResultDocument, TransformError> {
    let obj = report.as_object().ok_or(TransformError::NotAnObject)?;
    let report_id = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or(TransformError::MissingName)?;
    let validation = obj
        .get("iacValidationReport")
        .filter(|v| v.is_object())
        .ok_or(TransformError::MissingValidationReport)?;

    let (status, violations) = match validation.get("violations") {
        None | Some(Value::Null) => (TaskResultStatus::Passed, &[][..]),
        Some(Value::Array(list)) => (TaskResultStatus::Failed, list.as_slice()),
        Some(_) => return Err(TransformError::InvalidViolations),
    };

    let outcomes = violations
        .iter()
        .enumerate()
        .filter_map(|(i, v)| render_outcome(i, v))
        .collect();

    Ok(TaskResultDocument {
        status,
        message: count_severities(violations).summary(),
        url: Some(format!("https://{}/v1/{}", report_host, report_id)),
        outcomes: Some(outcomes),
    })
}
