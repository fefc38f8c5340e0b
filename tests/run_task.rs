//! End-to-end tests: a real gate on an ephemeral port talking to mock
//! Terraform and Security Posture servers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use iac_gate::gcp::{
    CollaboratorError, CredentialSource, GcpCredentials, ProjectDirectory, SecretManagerStore,
};
use iac_gate::hooks::compute_signature;
use iac_gate::pipeline::{Collaborators, PipelineConfig, RunTaskPipeline};
use iac_gate::plan::HttpPlanSource;
use iac_gate::server::{run_server_with_config, ServerConfig, ServerHandle};
use iac_gate::validation::{PollConfig, RetryPolicy, RetryingClient, SecurityPostureClient};

const HMAC_KEY: &str = "integration-hmac-key";
const RUN_TOKEN: &str = "tfc-run-token";

struct FixedCredentials;

#[async_trait]
impl CredentialSource for FixedCredentials {
    async fn credentials(&self) -> Result<GcpCredentials, CollaboratorError> {
        Ok(GcpCredentials {
            access_token: "ya29.integration".to_string(),
            project_id: "gate-project".to_string(),
        })
    }
}

struct FixedProjects;

#[async_trait]
impl ProjectDirectory for FixedProjects {
    async fn project_number(&self, _: &GcpCredentials) -> Result<String, CollaboratorError> {
        Ok("111".to_string())
    }

    async fn organization_id(&self, _: &GcpCredentials) -> Result<String, CollaboratorError> {
        Ok("222".to_string())
    }
}

/// What the mock Terraform and Security Posture endpoints observed.
#[derive(Default)]
struct Remote {
    callbacks: Mutex<Vec<(HeaderMap, Value)>>,
    submissions: Mutex<Vec<(String, HeaderMap, Value)>>,
    checks: AtomicUsize,
    secret_reads: AtomicUsize,
    /// Number of status checks answered with `done: false`; `usize::MAX` never finishes.
    pending_checks: usize,
    report: Value,
}

async fn spawn_remote(remote: Arc<Remote>) -> String {
    let submit = post(
        |State(remote): State<Arc<Remote>>,
         Path(rest): Path<String>,
         headers: HeaderMap,
         Json(body): Json<Value>| async move {
            remote.submissions.lock().push((rest, headers, body));
            Json(json!({"name": "organizations/222/locations/global/operations/op-7"}))
        },
    );
    let status = get(|State(remote): State<Arc<Remote>>, Path(rest): Path<String>| async move {
        if rest.ends_with(":access") {
            remote.secret_reads.fetch_add(1, Ordering::SeqCst);
            if !rest.ends_with("projects/111/secrets/HCP_TERRAFORM_HMAC/versions/latest:access") {
                return (StatusCode::NOT_FOUND, Json(json!({})));
            }
            return (
                StatusCode::OK,
                Json(json!({"payload": {"data": BASE64.encode(HMAC_KEY)}})),
            );
        }
        let n = remote.checks.fetch_add(1, Ordering::SeqCst);
        if n < remote.pending_checks {
            (StatusCode::OK, Json(json!({"name": "op-7", "done": false})))
        } else {
            (
                StatusCode::OK,
                Json(json!({"name": "op-7", "done": true, "response": remote.report.clone()})),
            )
        }
    });

    let app = Router::new()
        .route("/v1/*rest", submit.merge(status))
        .route(
            "/plan",
            get(|headers: HeaderMap| async move {
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    Some(auth) if auth == format!("Bearer {RUN_TOKEN}") => {
                        (StatusCode::OK, r#"{"format_version":"1.2","resource_changes":[]}"#)
                    }
                    _ => (StatusCode::UNAUTHORIZED, ""),
                }
            }),
        )
        .route(
            "/callback",
            patch(
                |State(remote): State<Arc<Remote>>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    remote.callbacks.lock().push((headers, body));
                    StatusCode::OK
                },
            ),
        )
        .with_state(remote);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    format!("http://{}", addr)
}

async fn start_gate(remote_base: &str) -> ServerHandle {
    let client = reqwest::Client::new();
    let collaborators = Collaborators {
        credentials: Arc::new(FixedCredentials),
        projects: Arc::new(FixedProjects),
        secrets: Arc::new(
            SecretManagerStore::new(client.clone(), "HCP_TERRAFORM_HMAC").with_base_url(remote_base),
        ),
        plans: Arc::new(HttpPlanSource::new(client.clone())),
    };
    let validation = SecurityPostureClient::new(RetryingClient::new(
        client.clone(),
        RetryPolicy::default(),
    ))
    .with_base_url(remote_base);
    let pipeline = RunTaskPipeline::new(
        collaborators,
        validation,
        client,
        PipelineConfig {
            poll: PollConfig {
                interval: Duration::from_millis(20),
                max_duration: None,
            },
            ..PipelineConfig::default()
        },
    );
    run_server_with_config(ServerConfig::for_testing(pipeline))
        .await
        .unwrap()
}

fn run_task_body(stage: &str, remote_base: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "payload_version": 1,
        "stage": stage,
        "access_token": RUN_TOKEN,
        "organization_name": "acme",
        "workspace_name": "network",
        "plan_json_api_url": format!("{remote_base}/plan"),
        "task_result_callback_url": format!("{remote_base}/callback")
    }))
    .unwrap()
}

async fn post_signed(gate: &ServerHandle, body: Vec<u8>, key: &str) -> reqwest::Response {
    let signature = compute_signature(key.as_bytes(), &body);
    reqwest::Client::new()
        .post(gate.base_url())
        .header("content-type", "application/json")
        .header("X-TFC-Task-Signature", signature)
        .body(body)
        .send()
        .await
        .unwrap()
}

fn callback_statuses(remote: &Remote) -> Vec<String> {
    remote
        .callbacks
        .lock()
        .iter()
        .map(|(_, body)| body["data"]["attributes"]["status"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_clean_plan_passes() {
    let remote = Arc::new(Remote {
        pending_checks: 1,
        report: json!({
            "name": "organizations/222/locations/global/reports/rep-1",
            "iacValidationReport": {}
        }),
        ..Remote::default()
    });
    let base = spawn_remote(remote.clone()).await;
    let gate = start_gate(&base).await;

    let response = post_signed(&gate, run_task_body("post_plan", &base), HMAC_KEY).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "200");

    assert_eq!(callback_statuses(&remote), vec!["running", "running", "passed"]);
    assert_eq!(remote.secret_reads.load(Ordering::SeqCst), 1);
    {
        let callbacks = remote.callbacks.lock();
        let (headers, last) = callbacks.last().unwrap();
        assert_eq!(headers["authorization"], format!("Bearer {RUN_TOKEN}"));
        assert_eq!(headers["content-type"], "application/vnd.api+json");
        assert_eq!(
            last["data"]["attributes"]["url"],
            "https://securityposture.googleapis.com/v1/organizations/222/locations/global/reports/rep-1"
        );
    }

    let submissions = remote.submissions.lock();
    assert_eq!(submissions.len(), 1);
    let (path, headers, body) = &submissions[0];
    assert!(path.ends_with("organizations/222/locations/global/reports:createIaCValidationReport"));
    assert_eq!(headers["authorization"], "Bearer ya29.integration");
    assert_eq!(headers["x-goog-user-project"], "gate-project");
    assert_eq!(body["parent"], "organizations/222/locations/global");
    drop(submissions);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_violations_fail_with_outcomes() {
    let remote = Arc::new(Remote {
        pending_checks: 0,
        report: json!({
            "name": "organizations/222/locations/global/reports/rep-2",
            "iacValidationReport": {"violations": [
                {
                    "assetId": "//storage.googleapis.com/projects/_/buckets/logs",
                    "policyId": "organizations/222/locations/global/postures/p/policies/no-public",
                    "severity": "CRITICAL",
                    "violatedPolicy": {"constraintType": "ORG_POLICY_CUSTOM"}
                },
                {"severity": "LOW"}
            ]}
        }),
        ..Remote::default()
    });
    let base = spawn_remote(remote.clone()).await;
    let gate = start_gate(&base).await;

    let response = post_signed(&gate, run_task_body("post_plan", &base), HMAC_KEY).await;
    assert_eq!(response.status(), 200);

    let callbacks = remote.callbacks.lock();
    let (_, last) = callbacks.last().unwrap();
    assert_eq!(last["data"]["attributes"]["status"], "failed");
    assert_eq!(
        last["data"]["attributes"]["message"],
        "1 LOW, 0 MEDIUM, 0 HIGH, 1 CRITICAL asset violations found"
    );
    let outcomes = last["data"]["relationships"]["outcomes"]["data"]
        .as_array()
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0]["attributes"]["outcome-id"], "violation-0");
    drop(callbacks);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_test_stage_touches_nothing() {
    let remote = Arc::new(Remote::default());
    let base = spawn_remote(remote.clone()).await;
    let gate = start_gate(&base).await;

    let response = post_signed(&gate, run_task_body("test", &base), "any-key").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "");
    assert!(remote.callbacks.lock().is_empty());
    assert!(remote.submissions.lock().is_empty());
    assert_eq!(remote.secret_reads.load(Ordering::SeqCst), 0);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_rejections() {
    let remote = Arc::new(Remote::default());
    let base = spawn_remote(remote.clone()).await;
    let gate = start_gate(&base).await;

    let response = post_signed(&gate, run_task_body("post_plan", &base), "wrong-key").await;
    assert_eq!(response.status(), 401);
    assert_eq!(response.text().await.unwrap(), "Invalid HMAC signature");

    let response = post_signed(&gate, br#"{"stage":"post_plan"}"#.to_vec(), HMAC_KEY).await;
    assert_eq!(response.status(), 400);
    assert_eq!(
        response.text().await.unwrap(),
        "Missing body field: access_token"
    );

    let response = reqwest::Client::new()
        .post(gate.base_url())
        .body(run_task_body("post_plan", &base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    assert!(remote.submissions.lock().is_empty());
    gate.shutdown().await;
}

#[tokio::test]
async fn test_health() {
    let remote = Arc::new(Remote::default());
    let base = spawn_remote(remote).await;
    let gate = start_gate(&base).await;

    let body: Value = reqwest::get(format!("{}/health", gate.base_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");

    gate.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_poll() {
    let remote = Arc::new(Remote {
        pending_checks: usize::MAX,
        ..Remote::default()
    });
    let base = spawn_remote(remote.clone()).await;
    let gate = start_gate(&base).await;
    let stop = gate.shutdown_token();

    let url = gate.base_url();
    let body = run_task_body("post_plan", &base);
    let signature = compute_signature(HMAC_KEY.as_bytes(), &body);
    let request = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .header("X-TFC-Task-Signature", signature)
            .body(body)
            .send()
            .await
            .unwrap()
    });

    // Let a few heartbeats go out before stopping.
    for _ in 0..200 {
        if remote.callbacks.lock().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(remote.callbacks.lock().len() >= 2);
    stop.cancel();

    let response = request.await.unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(
        response.text().await.unwrap(),
        "Polling cancelled before the validation operation finished"
    );
    gate.wait().await;
}
