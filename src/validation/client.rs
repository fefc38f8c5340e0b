//! Security Posture API client.
//!
//! Endpoints:
//!   POST {base}/v1/organizations/{org}/locations/global/reports:createIaCValidationReport
//!   GET  {base}/v1/{operation}

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::retry::{OutboundRequest, RetryingClient};
use super::ValidationError;
use crate::gcp::GcpCredentials;

pub const DEFAULT_SECURITY_POSTURE_URL: &str = "https://securityposture.googleapis.com";

const SUBMIT_CONTEXT: &str = "IaC Validation API";
const STATUS_CONTEXT: &str = "IaC Validation operation status";

/// Name of a long-running validation operation, used verbatim when polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of an operation as seen by one status check.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Pending,
    /// Finished; carries the operation's `response` payload.
    Done(Value),
    /// Finished with an `error` instead of a response.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IacPayload {
    /// Terraform JSON plan, standard base64.
    pub tf_plan: String,
}

/// `createIaCValidationReport` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateReportRequest {
    pub parent: String,
    pub iac: IacPayload,
}

/// `organizations/{org}/locations/global`
pub fn report_parent(org_id: &str) -> String {
    format!("organizations/{}/locations/global", org_id)
}

/// Submission body with the plan embedded as standard base64.
pub fn build_submission_body(plan: &[u8], org_id: &str) -> CreateReportRequest {
    CreateReportRequest {
        parent: report_parent(org_id),
        iac: IacPayload {
            tf_plan: BASE64.encode(plan),
        },
    }
}

/// Interpret one operation document.
pub fn parse_operation(doc: &Value) -> Result<OperationStatus, String> {
    let obj = doc
        .as_object()
        .ok_or_else(|| "operation is not a JSON object".to_string())?;

    // Long-running operations omit `done` until they finish.
    let done = match obj.get("done") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => return Err(format!("unexpected `done` value: {}", other)),
    };
    if !done {
        return Ok(OperationStatus::Pending);
    }

    if let Some(error) = obj.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Ok(OperationStatus::Failed(message));
    }

    obj.get("response")
        .cloned()
        .map(OperationStatus::Done)
        .ok_or_else(|| "finished operation has no `response`".to_string())
}

fn google_headers(creds: &GcpCredentials) -> Result<HeaderMap, ValidationError> {
    let invalid = |what: &str| ValidationError::MalformedResponse {
        context: SUBMIT_CONTEXT,
        message: format!("invalid {what} header value"),
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", creds.access_token))
            .map_err(|_| invalid("authorization"))?,
    );
    headers.insert("X-GFE-SSL", HeaderValue::from_static("yes"));
    headers.insert(
        "x-goog-user-project",
        HeaderValue::from_str(&creds.project_id).map_err(|_| invalid("project"))?,
    );
    Ok(headers)
}

/// Client for report submission and operation polling.
#[derive(Debug, Clone)]
pub struct SecurityPostureClient {
    http: RetryingClient,
    base_url: String,
}

impl SecurityPostureClient {
    pub fn new(http: RetryingClient) -> Self {
        Self {
            http,
            base_url: DEFAULT_SECURITY_POSTURE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Start a validation report for `plan`. Returns the operation name.
    pub async fn submit(
        &self,
        plan: &[u8],
        org_id: &str,
        creds: &GcpCredentials,
    ) -> Result<JobHandle, ValidationError> {
        let url = format!(
            "{}/v1/{}/reports:createIaCValidationReport",
            self.base_url,
            report_parent(org_id)
        );
        let body = serde_json::to_vec(&build_submission_body(plan, org_id)).map_err(|e| {
            ValidationError::MalformedResponse {
                context: SUBMIT_CONTEXT,
                message: e.to_string(),
            }
        })?;
        let request = OutboundRequest::new(Method::POST, url)
            .with_headers(google_headers(creds)?)
            .with_body(body);

        let response = self.http.execute(SUBMIT_CONTEXT, &request).await?;
        let doc: Value = response
            .json()
            .await
            .map_err(|e| ValidationError::MalformedResponse {
                context: SUBMIT_CONTEXT,
                message: e.to_string(),
            })?;

        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ValidationError::MalformedResponse {
                context: SUBMIT_CONTEXT,
                message: "response has no operation `name`".to_string(),
            })?;

        info!(target: "validation", operation = %name, "IaC validation submitted");
        Ok(JobHandle::new(name))
    }

    /// One status check of `handle`.
    pub async fn check(
        &self,
        handle: &JobHandle,
        creds: &GcpCredentials,
    ) -> Result<OperationStatus, ValidationError> {
        let url = format!("{}/v1/{}", self.base_url, handle.as_str());
        let request = OutboundRequest::new(Method::GET, url).with_headers(google_headers(creds)?);

        let response = self.http.execute(STATUS_CONTEXT, &request).await?;
        let doc: Value = response
            .json()
            .await
            .map_err(|e| ValidationError::MalformedResponse {
                context: STATUS_CONTEXT,
                message: e.to_string(),
            })?;

        let status = parse_operation(&doc).map_err(|message| ValidationError::MalformedResponse {
            context: STATUS_CONTEXT,
            message,
        })?;
        debug!(target: "validation", operation = %handle, ?status, "operation status");
        Ok(status)
    }

    /// Bind credentials so the client can be polled through [`OperationSource`].
    pub fn operations<'a>(&'a self, creds: &'a GcpCredentials) -> AuthorizedOperations<'a> {
        AuthorizedOperations { client: self, creds }
    }
}

/// Anything that can report the state of an operation.
#[async_trait]
pub trait OperationSource: Send + Sync {
    async fn check_operation(&self, handle: &JobHandle)
        -> Result<OperationStatus, ValidationError>;
}

/// [`SecurityPostureClient`] with credentials attached.
pub struct AuthorizedOperations<'a> {
    client: &'a SecurityPostureClient,
    creds: &'a GcpCredentials,
}

#[async_trait]
impl OperationSource for AuthorizedOperations<'_> {
    async fn check_operation(
        &self,
        handle: &JobHandle,
    ) -> Result<OperationStatus, ValidationError> {
        self.client.check(handle, self.creds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::RetryPolicy;
    use axum::extract::Path;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn creds() -> GcpCredentials {
        GcpCredentials {
            access_token: "ya29.test".to_string(),
            project_id: "my-project".to_string(),
        }
    }

    fn client(base: &str) -> SecurityPostureClient {
        let policy = RetryPolicy {
            delays: vec![Duration::from_millis(1); 3],
            ..RetryPolicy::default()
        };
        SecurityPostureClient::new(RetryingClient::new(reqwest::Client::new(), policy))
            .with_base_url(base)
    }

    #[test]
    fn test_submission_body_shape() {
        let body = build_submission_body(br#"{"resource_changes":[]}"#, "1234");
        assert_eq!(body.parent, "organizations/1234/locations/global");
        let decoded = BASE64.decode(&body.iac.tf_plan).unwrap();
        assert_eq!(decoded, br#"{"resource_changes":[]}"#);

        let wire = serde_json::to_value(&body).unwrap();
        assert_eq!(wire["iac"]["tf_plan"], body.iac.tf_plan);
    }

    #[test]
    fn test_parse_operation_states() {
        assert_eq!(
            parse_operation(&json!({"name": "op"})).unwrap(),
            OperationStatus::Pending
        );
        assert_eq!(
            parse_operation(&json!({"done": false})).unwrap(),
            OperationStatus::Pending
        );
        assert_eq!(
            parse_operation(&json!({"done": true, "response": {"name": "r"}})).unwrap(),
            OperationStatus::Done(json!({"name": "r"}))
        );
        assert_eq!(
            parse_operation(&json!({"done": true, "error": {"code": 3, "message": "bad plan"}}))
                .unwrap(),
            OperationStatus::Failed("bad plan".to_string())
        );
    }

    #[test]
    fn test_parse_operation_malformed() {
        assert!(parse_operation(&json!([])).is_err());
        assert!(parse_operation(&json!({"done": "yes"})).is_err());
        assert!(parse_operation(&json!({"done": true})).is_err());
    }

    type Seen = Arc<Mutex<Vec<(String, AxumHeaders, Value)>>>;

    async fn spawn_api(submit_response: Value, seen: Seen) -> String {
        let submit = post(
            move |Path(rest): Path<String>, headers: AxumHeaders, Json(body): Json<Value>| {
                let seen = seen.clone();
                let submit_response = submit_response.clone();
                async move {
                    seen.lock().push((rest, headers, body));
                    Json(submit_response)
                }
            },
        );
        let status = get(|Path(rest): Path<String>| async move {
            if rest.ends_with("op-done") {
                (
                    StatusCode::OK,
                    Json(json!({"name": "operations/op-done", "done": true, "response": {"name": "reports/r1"}})),
                )
            } else if rest.ends_with("op-pending") {
                (StatusCode::OK, Json(json!({"name": "operations/op-pending"})))
            } else {
                (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})))
            }
        });
        let app = Router::new().route("/v1/*rest", submit.merge(status));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_submit_returns_handle_and_sends_headers() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let base = spawn_api(json!({"name": "operations/op-done"}), seen.clone()).await;

        let handle = client(&base).submit(b"{}", "42", &creds()).await.unwrap();
        assert_eq!(handle.as_str(), "operations/op-done");

        let seen = seen.lock();
        let (path, headers, body) = &seen[0];
        assert!(path.ends_with("organizations/42/locations/global/reports:createIaCValidationReport"));
        assert_eq!(headers["authorization"], "Bearer ya29.test");
        assert_eq!(headers["x-goog-user-project"], "my-project");
        assert_eq!(headers["x-gfe-ssl"], "yes");
        assert_eq!(body["parent"], "organizations/42/locations/global");
        assert_eq!(body["iac"]["tf_plan"], BASE64.encode(b"{}"));
    }

    #[tokio::test]
    async fn test_submit_without_name_fails_closed() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let base = spawn_api(json!({"unexpected": true}), seen).await;

        let err = client(&base).submit(b"{}", "42", &creds()).await.unwrap_err();
        assert!(matches!(err, ValidationError::MalformedResponse { .. }));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_check_operation() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let base = spawn_api(json!({}), seen).await;
        let client = client(&base);
        let creds = creds();
        let ops = client.operations(&creds);

        assert_eq!(
            ops.check_operation(&JobHandle::new("operations/op-pending"))
                .await
                .unwrap(),
            OperationStatus::Pending
        );
        assert_eq!(
            ops.check_operation(&JobHandle::new("operations/op-done"))
                .await
                .unwrap(),
            OperationStatus::Done(json!({"name": "reports/r1"}))
        );
        let err = ops
            .check_operation(&JobHandle::new("operations/missing"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
