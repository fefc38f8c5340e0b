//! Inbound run-task webhook handling
//!
//! - Request body validation
//! - HMAC-SHA512 signature authentication

pub mod auth;
pub mod request;

pub use auth::{authenticate, compute_signature, extract_signature, verify_signature};
pub use request::{parse_run_task_request, RunTaskRequest, Stage};
