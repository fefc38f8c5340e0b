//! iac-gate library
//!
//! A Terraform Cloud run-task webhook that validates plans with the
//! Security Command Center IaC validation API and reports the result back
//! through the run-task callback protocol.

pub mod callback;
pub mod cli;
pub mod config;
pub mod gcp;
pub mod hooks;
pub mod logging;
pub mod pipeline;
pub mod plan;
pub mod server;
pub mod validation;
