//! CLI subcommand definitions and handlers.
//!
//! - `start` (default) -- run the webhook server
//! - `config show|path` -- print the resolved configuration or its file path
//! - `status` -- query a running instance's health endpoint
//! - `version` -- print version info

use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::{self, DEFAULT_PORT};

/// Terraform Cloud run task that validates plans against Security Command Center posture policies.
#[derive(Parser, Debug)]
#[command(name = "iac-gate", version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the webhook server (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommand>,
    },

    /// Query a running instance's health endpoint.
    Status {
        /// Port of the running instance (default: $PORT or 8080).
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Print the effective configuration as JSON (default).
    Show,
    /// Print the config file path.
    Path,
}

pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let resolved = config::load()?;
    println!("{}", serde_json::to_string_pretty(&resolved.to_value())?);
    Ok(())
}

pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

/// `--port`, then `$PORT`, then [`DEFAULT_PORT`], matching how the server binds.
fn resolve_port<F>(port: Option<u16>, env: F) -> u16
where
    F: Fn(&str) -> Option<String>,
{
    port.or_else(|| env("PORT").and_then(|p| p.parse().ok()))
        .unwrap_or(DEFAULT_PORT)
}

pub async fn handle_status(host: &str, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = resolve_port(port, |key| std::env::var(key).ok());
    let url = format!("http://{}:{}/health", host, port);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to iac-gate at {}:{}", host, port);
            eprintln!("  Error: {}", e);
            std::process::exit(1);
        }
    };

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    println!("iac-gate at {}:{}", host, port);
    println!("  HTTP status: {}", status);
    if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
        println!("  Version:     {}", version);
    }
    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

pub fn handle_version() {
    println!("iac-gate {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform: {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_start() {
        let cli = Cli::try_parse_from(["iac-gate"]).unwrap();
        assert_eq!(cli.command, None);
        let cli = Cli::try_parse_from(["iac-gate", "start"]).unwrap();
        assert_eq!(cli.command, Some(Command::Start));
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::try_parse_from(["iac-gate", "config"]).unwrap();
        assert_eq!(cli.command, Some(Command::Config { command: None }));
        let cli = Cli::try_parse_from(["iac-gate", "config", "path"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Config {
                command: Some(ConfigCommand::Path)
            })
        );
    }

    #[test]
    fn test_status_args() {
        let cli = Cli::try_parse_from(["iac-gate", "status", "-p", "9090"]).unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Status {
                port: Some(9090),
                host: "127.0.0.1".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["iac-gate", "serve-forever"]).is_err());
    }

    #[test]
    fn test_resolve_port_order() {
        let env = |port: &'static str| move |key: &str| (key == "PORT").then(|| port.to_string());
        assert_eq!(resolve_port(Some(1234), env("9000")), 1234);
        assert_eq!(resolve_port(None, env("9000")), 9000);
        assert_eq!(resolve_port(None, env("not-a-port")), DEFAULT_PORT);
        assert_eq!(resolve_port(None, |_: &str| None), DEFAULT_PORT);
    }
}
