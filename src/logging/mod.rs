//! Logging subsystem
//!
//! Structured logging via tracing with JSON (production) and plaintext
//! (development) output. Every line goes through [`redact::RedactingMakeWriter`].
//!
//! # Log Targets
//!
//! - `http` - inbound requests and responses
//! - `auth` - signature checks
//! - `validation` - plan submission, polling, results
//! - `callback` - task result delivery
//! - `gcp` - metadata server, Resource Manager, Secret Manager
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `IAC_GATE_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter

pub mod redact;

use std::io;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::logging::redact::RedactingMakeWriter;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_ENV_VAR: &str = "IAC_GATE_LOG";

static INIT_GUARD: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line, for log collectors.
    #[default]
    Json,
    Plaintext,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "plaintext" | "text" | "pretty" => Ok(LogFormat::Plaintext),
            other => Err(format!(
                "unknown log format '{}'; expected json or plaintext",
                other
            )),
        }
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Plaintext => "plaintext",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Level used when neither `IAC_GATE_LOG` nor `RUST_LOG` is set.
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stderr, used by the one-shot CLI commands.
    pub fn cli() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stderr,
            default_level: Level::WARN,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Parse a level name from config (`info`, `DEBUG`, ...).
pub fn parse_level(s: &str) -> Result<Level, String> {
    Level::from_str(s).map_err(|_| format!("unknown log level '{}'", s))
}

/// `IAC_GATE_LOG` first, then `RUST_LOG`, then `default_level` for our targets.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var(LOG_ENV_VAR) {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }

    let default_filter = format!(
        "warn,iac_gate={level},http={level},auth={level},validation={level},callback={level},gcp={level},config={level}",
        level = default_level.as_str().to_lowercase()
    );
    Ok(EnvFilter::try_new(default_filter)?)
}

fn install<M>(format: LogFormat, filter: EnvFilter, make_writer: M) -> Result<(), LoggingError>
where
    M: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let writer = RedactingMakeWriter::new(make_writer);
    let timer = UtcTime::rfc_3339();

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(writer)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(writer)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
    }
    Ok(())
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level)?;
    match config.output {
        LogOutput::Stdout => install(config.format, filter, io::stdout),
        LogOutput::Stderr => install(config.format, filter, io::stderr),
    }
}
