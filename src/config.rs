//! Process configuration from environment variables

use crate::error::{Result, WorkloadError};
use crate::evidence::{DEFAULT_ATTESTATION_CLI, DEFAULT_ATTESTATION_CONFIG};
use crate::unwrap::OaepDigest;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};

pub const ENV_SERVICE_PORT: &str = "SERVICE_PORT";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_LOG_CALLER: &str = "LOG_CALLER";
pub const ENV_SKIP_TLS_VERIFICATION: &str = "SKIP_TLS_VERIFICATION";
pub const ENV_HTTP_CLIENT_TIMEOUT: &str = "HTTP_CLIENT_TIMEOUT_IN_SECONDS";
pub const ENV_ITA_API_URL: &str = "ITA_API_URL";
pub const ENV_ITA_API_KEY: &str = "ITA_API_KEY";
pub const ENV_KBS_API_KEY: &str = "KBS_API_KEY";
pub const ENV_MODEL_PATH: &str = "MODEL_PATH";
pub const ENV_ATTESTATION_CLI: &str = "ATTESTATION_CLI";
pub const ENV_ATTESTATION_CONFIG: &str = "ATTESTATION_CONFIG";
pub const ENV_OAEP_DIGEST: &str = "OAEP_DIGEST";
pub const ENV_ENVELOPE_KEY_FILE: &str = "ENVELOPE_KEY_FILE";

const DEFAULT_PORT: u16 = 12780;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MODEL_PATH: &str = "/etc/model.enc";

/// Workload service configuration
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub port: u16,
    pub log_level: Level,
    /// Include source file and line in log lines
    pub log_caller: bool,
    pub skip_tls_verification: bool,
    pub http_client_timeout: Duration,
    /// Trust Authority API endpoint
    pub ita_url: String,
    pub ita_api_key: String,
    /// Sent as `x-api-key` on broker challenges; may be empty
    pub kbs_api_key: String,
    /// Encrypted model on disk
    pub model_path: PathBuf,
    pub attestation_cli: PathBuf,
    /// CLI config file passed to `token`
    pub attestation_config: PathBuf,
    pub oaep_digest: OaepDigest,
    /// When set, the envelope private key is persisted here (mode 0600)
    pub envelope_key_file: Option<PathBuf>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: Level::INFO,
            log_caller: false,
            skip_tls_verification: true,
            http_client_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            ita_url: String::new(),
            ita_api_key: String::new(),
            kbs_api_key: String::new(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            attestation_cli: PathBuf::from(DEFAULT_ATTESTATION_CLI),
            attestation_config: PathBuf::from(DEFAULT_ATTESTATION_CONFIG),
            oaep_digest: OaepDigest::default(),
            envelope_key_file: None,
        }
    }
}

impl WorkloadConfig {
    /// Reads the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from any variable source; unset variables
    /// keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(port) = var(ENV_SERVICE_PORT) {
            config.port = port.trim().parse().map_err(|_| {
                WorkloadError::Config(format!("{} is not a valid port: {}", ENV_SERVICE_PORT, port))
            })?;
        }

        if let Some(level) = var(ENV_LOG_LEVEL) {
            config.log_level = level.trim().parse().unwrap_or_else(|_| {
                warn!(level = %level, "Failed to parse log level, defaulting to info");
                Level::INFO
            });
        }

        if let Some(caller) = var(ENV_LOG_CALLER) {
            config.log_caller = parse_bool(ENV_LOG_CALLER, &caller)?;
        }

        if let Some(skip) = var(ENV_SKIP_TLS_VERIFICATION) {
            config.skip_tls_verification = parse_bool(ENV_SKIP_TLS_VERIFICATION, &skip)?;
        }

        if let Some(secs) = var(ENV_HTTP_CLIENT_TIMEOUT) {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                WorkloadError::Config(format!(
                    "{} must be a whole number of seconds: {}",
                    ENV_HTTP_CLIENT_TIMEOUT, secs
                ))
            })?;
            config.http_client_timeout = Duration::from_secs(secs);
        }

        if let Some(url) = var(ENV_ITA_API_URL) {
            config.ita_url = url;
        }
        if let Some(key) = var(ENV_ITA_API_KEY) {
            config.ita_api_key = key;
        }
        if let Some(key) = var(ENV_KBS_API_KEY) {
            config.kbs_api_key = key;
        }
        if let Some(path) = var(ENV_MODEL_PATH) {
            config.model_path = PathBuf::from(path);
        }
        if let Some(cli) = var(ENV_ATTESTATION_CLI) {
            config.attestation_cli = PathBuf::from(cli);
        }
        if let Some(path) = var(ENV_ATTESTATION_CONFIG) {
            config.attestation_config = PathBuf::from(path);
        }
        if let Some(digest) = var(ENV_OAEP_DIGEST) {
            config.oaep_digest = digest.parse()?;
        }
        config.envelope_key_file = var(ENV_ENVELOPE_KEY_FILE).map(PathBuf::from);

        info!(
            port = config.port,
            log_level = %config.log_level,
            skip_tls_verification = config.skip_tls_verification,
            http_client_timeout_secs = config.http_client_timeout.as_secs(),
            ita_url = %config.ita_url,
            model_path = %config.model_path.display(),
            oaep_digest = %config.oaep_digest,
            persist_envelope_key = config.envelope_key_file.is_some(),
            "Parsed configuration from environment"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port < 1024 {
            return Err(WorkloadError::Config(format!(
                "Configured port is not valid: {}",
                self.port
            )));
        }

        if self.ita_url.is_empty() || self.ita_api_key.is_empty() {
            return Err(WorkloadError::Config(
                "Either ITA API URL or API key is missing".to_string(),
            ));
        }

        Url::parse(&self.ita_url).map_err(|e| {
            WorkloadError::Config(format!("ITA API URL is not a valid url: {}", e))
        })?;

        BASE64.decode(self.ita_api_key.as_bytes()).map_err(|e| {
            WorkloadError::Config(format!("ITA API key is not a valid base64 string: {}", e))
        })?;

        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(WorkloadError::Config(format!(
            "{} must be true or false: {}",
            name, value
        ))),
    }
}
