//! TDX Model Workload Server
//!
//! Runs inside a TDX guest. Generates (or loads) the envelope key pair,
//! then serves the workload API over HTTP on `SERVICE_PORT`.
//!
//! # Environment
//!
//! - `ITA_API_URL`, `ITA_API_KEY`: required
//! - `MODEL_PATH`: encrypted model, default `/etc/model.enc`
//! - `ENVELOPE_KEY_FILE`: persist the envelope private key there (mode 0600)
//!
//! See [`tdx_model_workload::config`] for the full list.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tdx_model_workload::config::WorkloadConfig;
use tdx_model_workload::evidence::TrustAuthorityCli;
use tdx_model_workload::http;
use tdx_model_workload::{EnvelopeKeyPair, LinearClassifier, ModelStateMachine, WorkloadService};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

fn envelope_key(config: &WorkloadConfig) -> Result<EnvelopeKeyPair> {
    let Some(path) = &config.envelope_key_file else {
        return Ok(EnvelopeKeyPair::generate()?);
    };

    if path.exists() {
        info!(path = %path.display(), "Loading envelope key");
        return EnvelopeKeyPair::load(path)
            .with_context(|| format!("could not load envelope key from {}", path.display()));
    }

    let keypair = EnvelopeKeyPair::generate()?;
    keypair
        .persist(path)
        .with_context(|| format!("could not save envelope key to {}", path.display()))?;
    info!(path = %path.display(), "Saved envelope key");
    Ok(keypair)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Level is not known until the environment is parsed
    let config = WorkloadConfig::from_env()?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level)
        .with_target(false)
        .with_file(config.log_caller)
        .with_line_number(config.log_caller)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting TDX Model Workload...");
    config.validate()?;

    let envelope = Arc::new(envelope_key(&config)?);
    info!(fingerprint = %envelope.fingerprint(), "Envelope key ready");

    let http_client = reqwest::Client::builder()
        .timeout(config.http_client_timeout)
        .danger_accept_invalid_certs(config.skip_tls_verification)
        .build()
        .context("could not build HTTP client")?;

    let evidence = Arc::new(
        TrustAuthorityCli::new(&config.attestation_cli)
            .with_config_path(&config.attestation_config),
    );
    let model = Arc::new(ModelStateMachine::new(
        &config.model_path,
        Arc::clone(&envelope),
        config.oaep_digest,
        Box::new(LinearClassifier::default()),
    ));

    let service = Arc::new(
        WorkloadService::new(envelope, http_client, evidence, model)
            .with_broker_api_key(config.kbs_api_key.clone()),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    http::serve(service, addr).await?;
    Ok(())
}
