//! Attestation evidence collection
//!
//! Evidence comes from an external generator (the Trust Authority CLI in
//! production), treated as a black box: a base64 nonce and base64 user data
//! go in, a hardware quote comes out. The generator is never retried; any
//! failure is reported as [`WorkloadError::EvidenceGeneration`].

use crate::error::{Result, WorkloadError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Default evidence generator binary
pub const DEFAULT_ATTESTATION_CLI: &str = "trustauthority-cli";

/// Default CLI config file for token requests
pub const DEFAULT_ATTESTATION_CONFIG: &str = "config.json";

/// Source of attestation evidence
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    /// Produces a quote binding `nonce_b64` and `user_data_b64`
    async fn quote(&self, nonce_b64: &str, user_data_b64: &str) -> Result<Vec<u8>>;

    /// Produces an attestation token with `user_data_b64` bound into it
    async fn token(&self, user_data_b64: &str) -> Result<String>;
}

/// Quote and user data produced for one challenge
#[derive(Debug, Clone)]
pub struct Evidence {
    pub quote: Vec<u8>,
    /// Decoded user data the generator bound into the quote
    pub runtime_user_data: Vec<u8>,
}

/// Runs the Trust Authority CLI as a child process
#[derive(Debug, Clone)]
pub struct TrustAuthorityCli {
    program: PathBuf,
    config_path: PathBuf,
}

impl Default for TrustAuthorityCli {
    fn default() -> Self {
        Self::new(DEFAULT_ATTESTATION_CLI)
    }
}

impl TrustAuthorityCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: PathBuf::from(DEFAULT_ATTESTATION_CONFIG),
        }
    }

    /// Sets the CLI config file used for token requests
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                WorkloadError::EvidenceGeneration(format!(
                    "could not run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(WorkloadError::EvidenceGeneration(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl EvidenceSource for TrustAuthorityCli {
    async fn quote(&self, nonce_b64: &str, user_data_b64: &str) -> Result<Vec<u8>> {
        self.run(&["quote", "--nonce", nonce_b64, "--user-data", user_data_b64])
            .await
    }

    async fn token(&self, user_data_b64: &str) -> Result<String> {
        let config = self.config_path.to_string_lossy();
        let stdout = self
            .run(&[
                "token",
                "--config",
                &config,
                "--user-data",
                user_data_b64,
                "--policy-ids",
                "",
                "--no-eventlog",
            ])
            .await?;

        let token = String::from_utf8(stdout).map_err(|_| {
            WorkloadError::EvidenceGeneration("token is not valid UTF-8".to_string())
        })?;
        Ok(token.trim().to_string())
    }
}

/// Turns a nonce and the workload's user data into evidence
#[derive(Clone)]
pub struct EvidenceCollector {
    source: Arc<dyn EvidenceSource>,
}

impl EvidenceCollector {
    pub fn new(source: Arc<dyn EvidenceSource>) -> Self {
        Self { source }
    }

    pub async fn collect(&self, nonce: &[u8], user_data: &[u8]) -> Result<Evidence> {
        let nonce_b64 = BASE64.encode(nonce);
        let user_data_b64 = BASE64.encode(user_data);

        let quote = self.source.quote(&nonce_b64, &user_data_b64).await?;
        if quote.is_empty() {
            return Err(WorkloadError::EvidenceGeneration(
                "generator returned an empty quote".to_string(),
            ));
        }

        let runtime_user_data = BASE64
            .decode(user_data_b64.as_bytes())
            .map_err(|e| WorkloadError::EvidenceGeneration(format!("bad user data: {}", e)))?;

        info!(
            nonce_len = nonce.len(),
            quote_len = quote.len(),
            "Collected attestation evidence"
        );
        Ok(Evidence {
            quote,
            runtime_user_data,
        })
    }

    pub async fn attestation_token(&self, user_data: &[u8]) -> Result<String> {
        let token = self.source.token(&BASE64.encode(user_data)).await?;
        if token.is_empty() {
            return Err(WorkloadError::EvidenceGeneration(
                "generator returned an empty token".to_string(),
            ));
        }
        debug!(token_len = token.len(), "Fetched attestation token");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSource {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EvidenceSource for RecordingSource {
        async fn quote(&self, nonce_b64: &str, user_data_b64: &str) -> Result<Vec<u8>> {
            self.calls
                .lock()
                .unwrap()
                .push((nonce_b64.to_string(), user_data_b64.to_string()));
            Ok(b"QUOTE".to_vec())
        }

        async fn token(&self, _user_data_b64: &str) -> Result<String> {
            Ok("eyJ.token".to_string())
        }
    }

    #[tokio::test]
    async fn test_collect_encodes_inputs() {
        let source = Arc::new(RecordingSource::default());
        let collector = EvidenceCollector::new(source.clone());

        let evidence = collector.collect(b"nonce", &[1, 0, 1, 0, 0xAB]).await.unwrap();
        assert_eq!(evidence.quote, b"QUOTE");
        assert_eq!(evidence.runtime_user_data, vec![1, 0, 1, 0, 0xAB]);

        let calls = source.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, BASE64.encode(b"nonce"));
        assert_eq!(calls[0].1, BASE64.encode([1u8, 0, 1, 0, 0xAB]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_output_is_quote() {
        // `echo` stands in for the CLI and prints its arguments back
        let collector = EvidenceCollector::new(Arc::new(TrustAuthorityCli::new("echo")));
        let evidence = collector.collect(b"n", b"u").await.unwrap();
        let printed = String::from_utf8(evidence.quote).unwrap();
        assert_eq!(printed.trim(), "quote --nonce bg== --user-data dQ==");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_nonzero_exit() {
        let collector = EvidenceCollector::new(Arc::new(TrustAuthorityCli::new("false")));
        let result = collector.collect(b"n", b"u").await;
        assert!(matches!(result, Err(WorkloadError::EvidenceGeneration(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_token_uses_config_path() {
        let cli = TrustAuthorityCli::new("echo").with_config_path("/etc/ita/config.json");
        let token = cli.token("dQ==").await.unwrap();
        assert!(token.starts_with("token --config /etc/ita/config.json --user-data dQ=="));
        assert!(token.ends_with("--no-eventlog"));
    }

    #[tokio::test]
    async fn test_cli_missing_binary() {
        let cli = TrustAuthorityCli::new("/nonexistent/trustauthority-cli");
        let result = cli.token("dQ==").await;
        assert!(matches!(result, Err(WorkloadError::EvidenceGeneration(_))));
    }

    #[tokio::test]
    async fn test_attestation_token() {
        let collector = EvidenceCollector::new(Arc::new(RecordingSource::default()));
        assert_eq!(collector.attestation_token(b"u").await.unwrap(), "eyJ.token");
    }
}
