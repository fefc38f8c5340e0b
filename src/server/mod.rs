//! Server module
//!
//! HTTP listener for the run-task webhook.

pub mod http;
pub mod startup;

pub use http::{create_router, AppState, HttpConfig};
pub use startup::{build_pipeline, run_server_with_config, ServerConfig, ServerHandle};
