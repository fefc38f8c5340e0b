//! Configuration loading
//!
//! An optional JSON5 file plus environment variables, resolved once at
//! startup into a [`GateConfig`]. Env variables take precedence over the
//! file; string values may reference env variables as `${VAR}`.
//!
//! ```json5
//! {
//!   validation: { baseUrl: "https://securityposture.googleapis.com", pollIntervalSecs: 10 },
//!   retry: { delaysSecs: [5, 10, 20], statusCodes: [408, 429, 500, 502, 503, 504] },
//!   auth: { signatureHeader: "X-TFC-Task-Signature", secretName: "HCP_TERRAFORM_HMAC" },
//!   server: { maxBodyBytes: 5242880 },
//!   logging: { format: "json", level: "info" },
//! }
//! ```

use regex::Regex;
use serde_json::{json, Map, Value};
use std::env;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::gcp::DEFAULT_HMAC_SECRET_NAME;
use crate::hooks::auth::DEFAULT_SIGNATURE_HEADER;
use crate::logging::{parse_level, LogConfig, LogFormat};
use crate::validation::client::DEFAULT_SECURITY_POSTURE_URL;
use crate::validation::report::DEFAULT_REPORT_HOST;
use crate::validation::{PollConfig, RetryPolicy};

pub const CONFIG_PATH_ENV: &str = "IAC_GATE_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "iac-gate.json5";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

const KNOWN_SECTIONS: &[&str] = &["validation", "retry", "auth", "server", "logging"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Validation error at {path}: {message}")]
    Validation { path: String, message: String },
}

fn invalid(path: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        path: path.to_string(),
        message: message.into(),
    }
}

/// `IAC_GATE_CONFIG_PATH`, else `./iac-gate.json5`.
pub fn get_config_path() -> PathBuf {
    env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Read the config file. A missing file is an empty object.
pub fn load_config_file(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        debug!(target: "config", path = %path.display(), "no config file, using defaults");
        return Ok(Value::Object(Map::new()));
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut value: Value = json5::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if !value.is_object() {
        return Err(invalid(".", "config root must be an object"));
    }
    substitute_env_vars(&mut value)?;
    Ok(value)
}

fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => *s = substitute_env_in_string(s)?,
        Value::Object(obj) => {
            for v in obj.values_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// `${VAR}` is replaced by the variable, `$${VAR}` is a literal `${VAR}`.
fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").expect("failed to compile regex: env_var")
    });

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;
    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        result.push_str(&s[last_end..full.start()]);
        if full.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", name.as_str()));
        } else {
            let value = env::var(name.as_str()).map_err(|_| ConfigError::MissingEnvVar {
                var: name.as_str().to_string(),
            })?;
            result.push_str(&value);
        }
        last_end = full.end();
    }
    result.push_str(&s[last_end..]);
    Ok(result)
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub bind_address: SocketAddr,
    pub max_body_bytes: usize,
    pub validation_base_url: String,
    pub report_host: String,
    pub poll: PollConfig,
    pub retry: RetryPolicy,
    pub signature_header: String,
    pub secret_name: String,
    pub logging: LogConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            validation_base_url: DEFAULT_SECURITY_POSTURE_URL.to_string(),
            report_host: DEFAULT_REPORT_HOST.to_string(),
            poll: PollConfig::default(),
            retry: RetryPolicy::default(),
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            secret_name: DEFAULT_HMAC_SECRET_NAME.to_string(),
            logging: LogConfig::default(),
        }
    }
}

fn section<'a>(cfg: &'a Value, name: &str) -> Option<&'a Map<String, Value>> {
    cfg.get(name).and_then(Value::as_object)
}

fn get_str(obj: Option<&Map<String, Value>>, key: &str, path: &str) -> Result<Option<String>, ConfigError> {
    match obj.and_then(|o| o.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
        Some(_) => Err(invalid(path, "must be a non-empty string")),
    }
}

fn get_u64(obj: Option<&Map<String, Value>>, key: &str, path: &str) -> Result<Option<u64>, ConfigError> {
    match obj.and_then(|o| o.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(path, "must be a non-negative integer")),
    }
}

fn get_u64_list(
    obj: Option<&Map<String, Value>>,
    key: &str,
    path: &str,
) -> Result<Option<Vec<u64>>, ConfigError> {
    match obj.and_then(|o| o.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_u64()
                    .ok_or_else(|| invalid(path, "entries must be non-negative integers"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(invalid(path, "must be a list")),
    }
}

impl GateConfig {
    /// Resolve from the parsed file using the process environment.
    pub fn from_value(cfg: &Value) -> Result<Self, ConfigError> {
        Self::resolve(cfg, |name| env::var(name).ok())
    }

    /// Resolve from the parsed file, looking variables up through `env`.
    pub fn resolve<F>(cfg: &Value, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(obj) = cfg.as_object() {
            for key in obj.keys() {
                if !KNOWN_SECTIONS.contains(&key.as_str()) {
                    warn!(target: "config", "Unknown configuration key: {}", key);
                }
            }
        }

        let mut config = GateConfig::default();

        // Listener: PORT and IAC_GATE_HOST only come from the environment.
        let port = match env("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| invalid("PORT", format!("invalid port '{}'", raw)))?,
            None => DEFAULT_PORT,
        };
        let host = env("IAC_GATE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let ip: IpAddr = host
            .trim()
            .parse()
            .map_err(|_| invalid("IAC_GATE_HOST", format!("invalid address '{}'", host)))?;
        config.bind_address = SocketAddr::new(ip, port);

        let validation = section(cfg, "validation");
        if let Some(url) = get_str(validation, "baseUrl", ".validation.baseUrl")? {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(".validation.baseUrl", "must be an http(s) URL"));
            }
            config.validation_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(host) = get_str(validation, "reportHost", ".validation.reportHost")? {
            config.report_host = host;
        }
        if let Some(secs) = get_u64(validation, "pollIntervalSecs", ".validation.pollIntervalSecs")? {
            if secs == 0 {
                return Err(invalid(".validation.pollIntervalSecs", "must be at least 1"));
            }
            config.poll.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = get_u64(validation, "maxPollSecs", ".validation.maxPollSecs")? {
            config.poll.max_duration = Some(Duration::from_secs(secs));
        }

        let retry = section(cfg, "retry");
        if let Some(delays) = get_u64_list(retry, "delaysSecs", ".retry.delaysSecs")? {
            config.retry.delays = delays.into_iter().map(Duration::from_secs).collect();
        }
        if let Some(codes) = get_u64_list(retry, "statusCodes", ".retry.statusCodes")? {
            config.retry.retryable_status_codes = codes
                .into_iter()
                .map(|c| {
                    u16::try_from(c)
                        .ok()
                        .filter(|c| (100..=599).contains(c))
                        .ok_or_else(|| invalid(".retry.statusCodes", format!("invalid status {}", c)))
                })
                .collect::<Result<Vec<_>, _>>()?;
        }

        let auth = section(cfg, "auth");
        if let Some(header) = get_str(auth, "signatureHeader", ".auth.signatureHeader")? {
            if axum::http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                return Err(invalid(".auth.signatureHeader", "not a valid header name"));
            }
            config.signature_header = header;
        }
        if let Some(name) = get_str(auth, "secretName", ".auth.secretName")? {
            config.secret_name = name;
        }

        let server = section(cfg, "server");
        if let Some(bytes) = get_u64(server, "maxBodyBytes", ".server.maxBodyBytes")? {
            if bytes == 0 {
                return Err(invalid(".server.maxBodyBytes", "must be at least 1"));
            }
            config.max_body_bytes = usize::try_from(bytes)
                .map_err(|_| invalid(".server.maxBodyBytes", "too large"))?;
        }

        let logging = section(cfg, "logging");
        if let Some(format) = get_str(logging, "format", ".logging.format")? {
            config.logging.format = format
                .parse::<LogFormat>()
                .map_err(|e| invalid(".logging.format", e))?;
        }
        if let Some(level) = get_str(logging, "level", ".logging.level")? {
            config.logging.default_level =
                parse_level(&level).map_err(|e| invalid(".logging.level", e))?;
        }

        Ok(config)
    }

    /// Effective configuration as JSON, in the file's key layout.
    pub fn to_value(&self) -> Value {
        json!({
            "server": {
                "bind": self.bind_address.to_string(),
                "maxBodyBytes": self.max_body_bytes,
            },
            "validation": {
                "baseUrl": self.validation_base_url,
                "reportHost": self.report_host,
                "pollIntervalSecs": self.poll.interval.as_secs(),
                "maxPollSecs": self.poll.max_duration.map(|d| d.as_secs()),
            },
            "retry": {
                "delaysSecs": self.retry.delays.iter().map(Duration::as_secs).collect::<Vec<_>>(),
                "statusCodes": self.retry.retryable_status_codes,
            },
            "auth": {
                "signatureHeader": self.signature_header,
                "secretName": self.secret_name,
            },
            "logging": {
                "format": self.logging.format.as_str(),
                "level": self.logging.default_level.as_str().to_lowercase(),
            },
        })
    }
}

/// Load the file at [`get_config_path`] and resolve it against the environment.
pub fn load() -> Result<GateConfig, ConfigError> {
    let raw = load_config_file(&get_config_path())?;
    GateConfig::from_value(&raw)
}
