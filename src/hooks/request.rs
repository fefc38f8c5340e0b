//! Run-task webhook request parsing
//!
//! Terraform sends:
//! - `stage` - `test` when the run task is being registered, otherwise the run stage
//! - `access_token` - bearer token for the plan and callback URLs
//! - `organization_name`
//! - `plan_json_api_url` - where to fetch the JSON plan
//! - `task_result_callback_url` - where to PATCH task results

use serde::Deserialize;
use serde_json::Value;

/// Body fields every run-task request must carry, in reporting order.
pub const REQUIRED_BODY_FIELDS: &[&str] = &[
    "stage",
    "access_token",
    "organization_name",
    "plan_json_api_url",
    "task_result_callback_url",
];

/// Run stage reported by Terraform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Connectivity check sent when the run task is created or edited.
    Test,
    /// Any real run stage (`pre_plan`, `post_plan`, `pre_apply`, ...).
    Run(String),
}

impl Stage {
    pub fn parse(s: &str) -> Self {
        match s {
            "test" => Stage::Test,
            other => Stage::Run(other.to_string()),
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, Stage::Test)
    }
}

/// Raw run-task body. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct RunTaskBody {
    stage: String,
    access_token: String,
    organization_name: String,
    plan_json_api_url: String,
    task_result_callback_url: String,
}

/// A run-task request whose required fields are all present.
#[derive(Debug, Clone)]
pub struct RunTaskRequest {
    pub stage: Stage,
    pub access_token: String,
    pub organization_name: String,
    pub plan_json_api_url: String,
    pub task_result_callback_url: String,
}

/// Parse and validate a run-task body.
///
/// Errors carry the message returned to the caller with a 400.
pub fn parse_run_task_request(body: &[u8]) -> Result<RunTaskRequest, String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|_| "Invalid JSON body".to_string())?;

    let obj = value
        .as_object()
        .ok_or_else(|| "Invalid JSON body".to_string())?;

    if let Some(missing) = REQUIRED_BODY_FIELDS
        .iter()
        .find(|field| !obj.contains_key(**field))
    {
        return Err(format!("Missing body field: {}", missing));
    }

    let raw: RunTaskBody = serde_json::from_value(value)
        .map_err(|e| format!("Invalid body field: {}", e))?;

    Ok(RunTaskRequest {
        stage: Stage::parse(&raw.stage),
        access_token: raw.access_token,
        organization_name: raw.organization_name,
        plan_json_api_url: raw.plan_json_api_url,
        task_result_callback_url: raw.task_result_callback_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_body() -> Value {
        json!({
            "payload_version": 1,
            "stage": "post_plan",
            "access_token": "tfc-token",
            "organization_name": "acme",
            "plan_json_api_url": "https://app.terraform.io/api/v2/plans/plan-1/json-output",
            "task_result_callback_url": "https://app.terraform.io/api/v2/task-results/tr-1/callback"
        })
    }

    #[test]
    fn test_parse_valid_request() {
        let body = serde_json::to_vec(&full_body()).unwrap();
        let req = parse_run_task_request(&body).unwrap();
        assert_eq!(req.stage, Stage::Run("post_plan".to_string()));
        assert!(!req.stage.is_test());
        assert_eq!(req.access_token, "tfc-token");
        assert_eq!(req.organization_name, "acme");
    }

    #[test]
    fn test_parse_test_stage() {
        let mut body = full_body();
        body["stage"] = json!("test");
        let req = parse_run_task_request(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert!(req.stage.is_test());
    }

    #[test]
    fn test_each_missing_field_is_reported() {
        for field in REQUIRED_BODY_FIELDS {
            let mut body = full_body();
            body.as_object_mut().unwrap().remove(*field);
            let err = parse_run_task_request(&serde_json::to_vec(&body).unwrap()).unwrap_err();
            assert_eq!(err, format!("Missing body field: {}", field));
        }
    }

    #[test]
    fn test_invalid_json() {
        assert_eq!(
            parse_run_task_request(b"not json").unwrap_err(),
            "Invalid JSON body"
        );
        assert_eq!(parse_run_task_request(b"[1,2]").unwrap_err(), "Invalid JSON body");
    }

    #[test]
    fn test_non_string_field_rejected() {
        let mut body = full_body();
        body["access_token"] = json!(42);
        let err = parse_run_task_request(&serde_json::to_vec(&body).unwrap()).unwrap_err();
        assert!(err.starts_with("Invalid body field"), "{err}");
    }
}
