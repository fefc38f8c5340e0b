use clap::Parser;
use tracing::{error, info, warn};

use iac_gate::cli::{self, Cli, Command, ConfigCommand};
use iac_gate::config;
use iac_gate::logging::{init_logging, LogConfig};
use iac_gate::server::{build_pipeline, run_server_with_config, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Start) => run_server().await,

        Some(Command::Config { command }) => {
            let _ = init_logging(LogConfig::cli());
            match command.unwrap_or(ConfigCommand::Show) {
                ConfigCommand::Show => cli::handle_config_show()?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Status { port, host }) => cli::handle_status(&host, port).await,

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let gate_config = config::load()?;
    init_logging(gate_config.logging.clone())?;
    info!(
        target: "config",
        bind = %gate_config.bind_address,
        validation = %gate_config.validation_base_url,
        poll_interval_secs = gate_config.poll.interval.as_secs(),
        "configuration loaded"
    );

    let pipeline = build_pipeline(&gate_config)?;
    let handle = run_server_with_config(ServerConfig::new(&gate_config, pipeline))
        .await
        .map_err(|e| e.to_string())?;
    info!(target: "http", "iac-gate {} ready on {}", env!("CARGO_PKG_VERSION"), handle.base_url());

    let trigger = await_shutdown_trigger().await;
    info!(target: "http", "{} received, shutting down", trigger);
    handle.shutdown().await;
    Ok(())
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<&'static str>().await
        }
    }
}
