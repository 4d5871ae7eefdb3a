use std::env;
use std::net::SocketAddr;

use anyhow::{anyhow, Context, Result};
use tracing::Level;

/// Output format for process logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Immutable startup configuration.  Built once from the environment and
/// shared by reference with every handler; an invalid value aborts startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the x509 certificate for the webhook listener.
    pub cert_file: String,
    /// Path to the private key belonging to the certificate.
    pub key_file: String,
    pub log_format: LogFormat,
    pub log_level: Level,
    pub webhook_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    /// Maximum accepted raw request body size in bytes (None => unlimited)
    pub max_request_bytes: Option<usize>,
}

impl AppConfig {
    /// Reads the following variables:
    ///
    /// * `WEBHOOK_CERT_FILE` / `WEBHOOK_KEY_FILE` – TLS material paths.
    /// * `LOG_FORMAT` – `json` or `text`.
    /// * `LOG_LEVEL` – verbosity for the default log filter.
    /// * `WEBHOOK_ADDR` / `METRICS_ADDR` – listener bind addresses.
    /// * `WEBHOOK_MAX_REQUEST_BYTES` (optional) – admission body cap.
    pub fn from_env() -> Result<Self> {
        let cert_file = env::var("WEBHOOK_CERT_FILE").unwrap_or_else(|_| "./cert.pem".to_owned());
        let key_file = env::var("WEBHOOK_KEY_FILE").unwrap_or_else(|_| "./key.pem".to_owned());

        let log_format = match env::var("LOG_FORMAT") {
            Ok(value) => parse_log_format(&value)
                .ok_or_else(|| anyhow!("log format '{}' is not recognized", value))?,
            Err(_) => LogFormat::Text,
        };

        let log_level = match env::var("LOG_LEVEL") {
            Ok(value) => value
                .trim()
                .parse::<Level>()
                .map_err(|_| anyhow!("log level '{}' is not recognized", value))?,
            Err(_) => Level::INFO,
        };

        let webhook_addr = parse_addr("WEBHOOK_ADDR", "0.0.0.0:8443")?;
        let metrics_addr = parse_addr("METRICS_ADDR", "0.0.0.0:8080")?;
        let max_request_bytes =
            parse_optional_u64("WEBHOOK_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        Ok(Self {
            cert_file,
            key_file,
            log_format,
            log_level,
            webhook_addr,
            metrics_addr,
            max_request_bytes,
        })
    }
}

fn parse_log_format(value: &str) -> Option<LogFormat> {
    match value.trim().to_ascii_lowercase().as_str() {
        "text" => Some(LogFormat::Text),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

fn parse_addr(var: &str, default: &str) -> Result<SocketAddr> {
    let raw = env::var(var).unwrap_or_else(|_| default.to_owned());
    raw.parse::<SocketAddr>()
        .with_context(|| format!("{} '{}' is not a valid socket address", var, raw))
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}
