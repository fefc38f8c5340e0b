//! Server assembly and lifecycle.
//!
//! [`build_pipeline`] wires the production collaborators from a
//! [`GateConfig`]; [`run_server_with_config`] binds the listener and returns
//! a [`ServerHandle`] so integration tests can start the gate on an
//! ephemeral port and shut it down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::GateConfig;
use crate::gcp::{MetadataCredentials, ResourceManagerClient, SecretManagerStore};
use crate::pipeline::{Collaborators, PipelineConfig, RunTaskPipeline};
use crate::plan::HttpPlanSource;
use crate::server::http::{create_router, AppState, HttpConfig};
use crate::validation::{RetryingClient, SecurityPostureClient};

const USER_AGENT: &str = concat!("iac-gate/", env!("CARGO_PKG_VERSION"));

/// Build the pipeline against the real Google and Terraform endpoints.
pub fn build_pipeline(config: &GateConfig) -> Result<RunTaskPipeline, reqwest::Error> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let collaborators = Collaborators {
        credentials: Arc::new(MetadataCredentials::new(client.clone())),
        projects: Arc::new(ResourceManagerClient::new(client.clone())),
        secrets: Arc::new(SecretManagerStore::new(
            client.clone(),
            config.secret_name.clone(),
        )),
        plans: Arc::new(HttpPlanSource::new(client.clone())),
    };

    let validation = SecurityPostureClient::new(RetryingClient::new(
        client.clone(),
        config.retry.clone(),
    ))
    .with_base_url(config.validation_base_url.clone());

    Ok(RunTaskPipeline::new(
        collaborators,
        validation,
        client,
        PipelineConfig {
            signature_header: config.signature_header.clone(),
            poll: config.poll,
            report_host: config.report_host.clone(),
        },
    ))
}

/// Everything needed to start a server.
pub struct ServerConfig {
    pub http_config: HttpConfig,
    pub bind_address: SocketAddr,
    pub pipeline: Arc<RunTaskPipeline>,
}

impl ServerConfig {
    pub fn new(config: &GateConfig, pipeline: RunTaskPipeline) -> Self {
        Self {
            http_config: HttpConfig {
                max_body_bytes: config.max_body_bytes,
            },
            bind_address: config.bind_address,
            pipeline: Arc::new(pipeline),
        }
    }

    /// Binds to `127.0.0.1:0` (OS-assigned port).
    pub fn for_testing(pipeline: RunTaskPipeline) -> Self {
        Self {
            http_config: HttpConfig::default(),
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            pipeline: Arc::new(pipeline),
        }
    }
}

/// Handle to a running server.  Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting requests, cancel in-flight polls and wait for the
    /// server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.wait().await;
    }

    /// Wait for the server to stop after its token was cancelled elsewhere.
    pub async fn wait(self) {
        match tokio::time::timeout(Duration::from_secs(10), self.server_task).await {
            Ok(Ok(Ok(()))) => info!(target: "http", "server stopped"),
            Ok(Ok(Err(e))) => error!(target: "http", "Server task returned error: {}", e),
            Ok(Err(e)) => error!(target: "http", "Server task panicked: {}", e),
            Err(_) => warn!(target: "http", "Server task did not finish within 10s timeout"),
        }
    }
}

pub async fn run_server_with_config(
    config: ServerConfig,
) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
    let shutdown = CancellationToken::new();
    let app = create_router(
        config.http_config,
        AppState {
            pipeline: config.pipeline,
            shutdown: shutdown.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(target: "http", address = %local_addr, "listening");

    let stop = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown,
        server_task,
    })
}
