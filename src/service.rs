//! Workload service surface
//!
//! Ties the pieces together for the transport layer: quotes over the
//! envelope public key, attestation-gated key retrieval, model decrypt,
//! inference and reset. Each operation logs its duration at debug level.

use crate::broker::{KeyBrokerClient, KeyTransferRequest, KeyTransferResponse};
use crate::encoding::{base64_bytes, decimal_string};
use crate::error::{Result, WorkloadError};
use crate::evidence::{EvidenceCollector, EvidenceSource};
use crate::keypair::EnvelopeKeyPair;
use crate::model::{Features, ModelState, ModelStateMachine};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "TDX Model Workload";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetQuoteRequest {
    #[serde(rename = "Nonce", alias = "nonce", with = "base64_bytes")]
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetQuoteResponse {
    #[serde(with = "base64_bytes")]
    pub quote: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub user_data: Vec<u8>,
}

/// A non-empty `attestation_token` skips the challenge phase
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetKeyRequest {
    #[serde(default)]
    pub attestation_token: String,
    pub key_transfer_url: String,
}

pub type GetKeyResponse = KeyTransferResponse;

/// Wrapped keys handed back for decryption, in the `/key` response shape
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecryptRequest {
    #[serde(with = "base64_bytes")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub wrapped_swk: Vec<u8>,
}

impl From<GetKeyResponse> for DecryptRequest {
    fn from(keys: GetKeyResponse) -> Self {
        Self {
            wrapped_key: keys.wrapped_key,
            wrapped_swk: keys.wrapped_swk,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InferRequest {
    #[serde(deserialize_with = "decimal_string")]
    pub pregnancies: f64,
    #[serde(rename = "blood-glucose", deserialize_with = "decimal_string")]
    pub blood_glucose: f64,
    #[serde(rename = "blood-pressure", deserialize_with = "decimal_string")]
    pub blood_pressure: f64,
    #[serde(rename = "skin-thickness", deserialize_with = "decimal_string")]
    pub skin_thickness: f64,
    #[serde(deserialize_with = "decimal_string")]
    pub insulin: f64,
    #[serde(deserialize_with = "decimal_string")]
    pub bmi: f64,
    #[serde(deserialize_with = "decimal_string")]
    pub age: f64,
    #[serde(deserialize_with = "decimal_string")]
    pub dbf: f64,
}

impl From<InferRequest> for Features {
    fn from(req: InferRequest) -> Self {
        Features {
            pregnancies: req.pregnancies,
            glucose: req.blood_glucose,
            blood_pressure: req.blood_pressure,
            skin_thickness: req.skin_thickness,
            insulin: req.insulin,
            bmi: req.bmi,
            dbf: req.dbf,
            age: req.age,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferResponse {
    #[serde(rename = "high-risk")]
    pub high_risk: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationTokenResponse {
    pub attestation_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionRequest {
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceVersion {
    pub name: String,
    pub version: String,
    pub git_hash: String,
    pub build_date: String,
}

impl ServiceVersion {
    pub fn current() -> Self {
        Self {
            name: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_hash: option_env!("GIT_HASH").unwrap_or_default().to_string(),
            build_date: option_env!("BUILD_DATE").unwrap_or_default().to_string(),
        }
    }
}

/// The workload's operations, shared across request handlers
pub struct WorkloadService {
    envelope: Arc<EnvelopeKeyPair>,
    http: Client,
    evidence: EvidenceCollector,
    model: Arc<ModelStateMachine>,
    broker_api_key: String,
}

impl WorkloadService {
    pub fn new(
        envelope: Arc<EnvelopeKeyPair>,
        http: Client,
        evidence: Arc<dyn EvidenceSource>,
        model: Arc<ModelStateMachine>,
    ) -> Self {
        Self {
            envelope,
            http,
            evidence: EvidenceCollector::new(evidence),
            model,
            broker_api_key: String::new(),
        }
    }

    /// `x-api-key` sent with broker challenges
    pub fn with_broker_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.broker_api_key = api_key.into();
        self
    }

    pub fn envelope(&self) -> &EnvelopeKeyPair {
        &self.envelope
    }

    pub async fn model_state(&self) -> ModelState {
        self.model.state().await
    }

    pub async fn get_quote(&self, req: GetQuoteRequest) -> Result<GetQuoteResponse> {
        let started = Instant::now();
        let result = self
            .evidence
            .collect(&req.nonce, self.envelope.public_key_bytes())
            .await
            .map(|evidence| GetQuoteResponse {
                quote: evidence.quote,
                user_data: evidence.runtime_user_data,
            })
            .map_err(|e| e.in_stage("could not fetch quote"));
        log_outcome("GetQuote", started, &result);
        result
    }

    pub async fn get_key(&self, req: GetKeyRequest) -> Result<GetKeyResponse> {
        let started = Instant::now();
        let result = self.transfer_key(req).await;
        log_outcome("GetKey", started, &result);
        result
    }

    /// Challenge, evidence, transfer. Strictly in that order, no retries.
    async fn transfer_key(&self, req: GetKeyRequest) -> Result<GetKeyResponse> {
        let url = Url::parse(&req.key_transfer_url).map_err(|e| {
            WorkloadError::BadRequest(format!("invalid key transfer url: {}", e))
        })?;
        let client = KeyBrokerClient::new(self.http.clone(), url, self.broker_api_key.clone());

        let request = if !req.attestation_token.is_empty() {
            KeyTransferRequest::with_token(req.attestation_token)
        } else {
            let challenge = client
                .challenge()
                .await
                .map_err(|e| e.in_stage("could not get key"))?;
            if let Some(scheme) = &challenge.attestation_type {
                debug!(attestation_type = %scheme, "Broker expects attestation scheme");
            }

            let nonce = challenge.nonce()?;
            let evidence = self
                .evidence
                .collect(&nonce.quote_nonce(), self.envelope.public_key_bytes())
                .await
                .map_err(|e| e.in_stage("could not get quote"))?;

            KeyTransferRequest::with_evidence(evidence.quote, nonce, evidence.runtime_user_data)
        };

        client
            .transfer_key_with_evidence(&request)
            .await
            .map_err(|e| e.in_stage("could not transfer key"))
    }

    pub async fn decrypt(&self, req: DecryptRequest) -> Result<()> {
        let started = Instant::now();
        let mut wrapped_swk = Zeroizing::new(req.wrapped_swk);
        let mut wrapped_dek = Zeroizing::new(req.wrapped_key);

        let result = self
            .model
            .decrypt(&mut wrapped_swk, &mut wrapped_dek)
            .await
            .map_err(|e| e.in_stage("could not decrypt model"));
        log_outcome("Decrypt", started, &result);
        result
    }

    pub async fn execute(&self, req: InferRequest) -> Result<InferResponse> {
        let started = Instant::now();
        let result = self
            .model
            .execute(&Features::from(req))
            .await
            .map(|high_risk| InferResponse { high_risk })
            .map_err(|e| e.in_stage("could not execute model"));
        log_outcome("Execute", started, &result);
        result
    }

    pub async fn reset(&self) -> Result<()> {
        let started = Instant::now();
        let result = self.model.reset().await;
        log_outcome("Reset", started, &result);
        result
    }

    pub async fn get_attestation_token(&self) -> Result<AttestationTokenResponse> {
        let started = Instant::now();
        let result = self
            .evidence
            .attestation_token(self.envelope.public_key_bytes())
            .await
            .map(|attestation_token| AttestationTokenResponse { attestation_token })
            .map_err(|e| e.in_stage("could not fetch token"));
        log_outcome("GetAttestationToken", started, &result);
        result
    }

    pub async fn provision(&self, req: ProvisionRequest) -> Result<()> {
        let started = Instant::now();
        let result = URL_SAFE
            .decode(req.api_key.as_bytes())
            .map(|_| ())
            .map_err(|e| {
                WorkloadError::BadRequest(format!("Invalid Api key, must be base64 string: {}", e))
            });
        log_outcome("Provision", started, &result);
        result
    }

    pub fn version(&self) -> ServiceVersion {
        ServiceVersion::current()
    }
}

fn log_outcome<T>(operation: &str, started: Instant, result: &Result<T>) {
    let elapsed_us = started.elapsed().as_micros() as u64;
    match result {
        Ok(_) => debug!(operation, elapsed_us, "Operation complete"),
        Err(e) => {
            debug!(operation, elapsed_us, "Operation failed");
            warn!(operation, error = %e, "Request failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::tests::test_private_key;
    use crate::model::LinearClassifier;
    use crate::test_helpers::{MockHttpServer, MockResponse};
    use crate::unwrap::OaepDigest;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEvidence {
        nonces: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EvidenceSource for FakeEvidence {
        async fn quote(&self, nonce_b64: &str, _user_data_b64: &str) -> Result<Vec<u8>> {
            self.nonces.lock().unwrap().push(nonce_b64.to_string());
            Ok(b"td-quote".to_vec())
        }

        async fn token(&self, _user_data_b64: &str) -> Result<String> {
            Ok("eyJhbGciOiJQUzM4NCJ9.payload.sig".to_string())
        }
    }

    fn service(evidence: Arc<FakeEvidence>) -> WorkloadService {
        let envelope = Arc::new(EnvelopeKeyPair::from_private_key(test_private_key()).unwrap());
        let model = Arc::new(ModelStateMachine::new(
            "/nonexistent/model.enc",
            envelope.clone(),
            OaepDigest::Sha256,
            Box::new(LinearClassifier::default()),
        ));
        WorkloadService::new(envelope, Client::new(), evidence, model)
            .with_broker_api_key("kbs-key")
    }

    const KEYS_JSON: &str = r#"{"wrapped_key":"AAEC","wrapped_swk":"AwQF"}"#;

    #[tokio::test]
    async fn test_get_quote_binds_public_key() {
        let evidence = Arc::new(FakeEvidence::default());
        let svc = service(evidence.clone());

        let resp = svc
            .get_quote(GetQuoteRequest {
                nonce: b"abc".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(resp.quote, b"td-quote");
        assert_eq!(resp.user_data, svc.envelope().public_key_bytes());
        assert_eq!(evidence.nonces.lock().unwrap()[0], BASE64.encode(b"abc"));
    }

    #[tokio::test]
    async fn test_get_key_with_evidence() {
        let server = MockHttpServer::start(vec![
            MockResponse::new(200, r#"{"val":"AQID","iat":"BAUG"}"#)
                .with_header("Attestation-Type", "TDX"),
            MockResponse::new(200, KEYS_JSON),
        ])
        .await;
        let evidence = Arc::new(FakeEvidence::default());
        let svc = service(evidence.clone());

        let keys = svc
            .get_key(GetKeyRequest {
                attestation_token: String::new(),
                key_transfer_url: format!("{}/kbs/v1/keys/abc/transfer", server.base_url),
            })
            .await
            .unwrap();
        assert_eq!(keys.wrapped_key, vec![0, 1, 2]);
        assert_eq!(keys.wrapped_swk, vec![3, 4, 5]);

        // Quote nonce is val || iat
        assert_eq!(
            evidence.nonces.lock().unwrap().as_slice(),
            &[BASE64.encode([1u8, 2, 3, 4, 5, 6])]
        );

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].header("x-api-key").as_deref(), Some("kbs-key"));
        let body = requests[1].json();
        assert_eq!(body["quote"], BASE64.encode(b"td-quote"));
        assert_eq!(body["nonce"]["val"], "AQID");
        assert_eq!(
            body["user_data"],
            BASE64.encode(svc.envelope().public_key_bytes())
        );
    }

    #[tokio::test]
    async fn test_get_key_with_token_skips_challenge() {
        let server = MockHttpServer::start(vec![MockResponse::new(200, KEYS_JSON)]).await;
        let evidence = Arc::new(FakeEvidence::default());
        let svc = service(evidence.clone());

        svc.get_key(GetKeyRequest {
            attestation_token: "tok".to_string(),
            key_transfer_url: server.base_url.clone(),
        })
        .await
        .unwrap();

        assert!(evidence.nonces.lock().unwrap().is_empty());
        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].json()["attestation_token"], "tok");
    }

    #[tokio::test]
    async fn test_challenge_failure_collects_no_evidence() {
        let server = MockHttpServer::start(vec![MockResponse::new(500, "{}")]).await;
        let evidence = Arc::new(FakeEvidence::default());
        let svc = service(evidence.clone());

        let result = svc
            .get_key(GetKeyRequest {
                attestation_token: String::new(),
                key_transfer_url: server.base_url.clone(),
            })
            .await;
        assert!(matches!(result, Err(WorkloadError::Protocol(_))));
        assert!(evidence.nonces.lock().unwrap().is_empty());
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_get_key_bad_url() {
        let svc = service(Arc::new(FakeEvidence::default()));
        let result = svc
            .get_key(GetKeyRequest {
                attestation_token: String::new(),
                key_transfer_url: "::not a url".to_string(),
            })
            .await;
        assert!(matches!(result, Err(WorkloadError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_decrypt_missing_model_then_execute() {
        let svc = service(Arc::new(FakeEvidence::default()));
        let result = svc
            .decrypt(DecryptRequest {
                wrapped_key: vec![1; 60],
                wrapped_swk: vec![2; 256],
            })
            .await;
        assert!(matches!(result, Err(WorkloadError::ModelFileMissing(_))));
        assert_eq!(svc.model_state().await, ModelState::Empty);

        let features: InferRequest = serde_json::from_str(
            r#"{"pregnancies":"1","blood-glucose":"85","blood-pressure":"66","skin-thickness":"29",
                "insulin":"0","bmi":"26.6","age":"31","dbf":"0.351"}"#,
        )
        .unwrap();
        assert!(matches!(
            svc.execute(features).await,
            Err(WorkloadError::ModelNotReady)
        ));
        svc.reset().await.unwrap();
    }

    #[tokio::test]
    async fn test_attestation_token() {
        let svc = service(Arc::new(FakeEvidence::default()));
        let resp = svc.get_attestation_token().await.unwrap();
        assert!(resp.attestation_token.starts_with("eyJ"));
    }

    #[tokio::test]
    async fn test_provision() {
        let svc = service(Arc::new(FakeEvidence::default()));
        svc.provision(ProvisionRequest {
            api_key: URL_SAFE.encode(b"key with ~~ bytes??"),
        })
        .await
        .unwrap();

        let result = svc
            .provision(ProvisionRequest {
                api_key: "not/base64+url".to_string(),
            })
            .await;
        assert!(matches!(result, Err(WorkloadError::BadRequest(_))));
    }

    #[test]
    fn test_request_shapes() {
        let quote: GetQuoteRequest = serde_json::from_str(r#"{"Nonce":"AQID"}"#).unwrap();
        assert_eq!(quote.nonce, vec![1, 2, 3]);
        assert!(serde_json::from_str::<GetQuoteRequest>(r#"{"Nonce":"AQID","x":1}"#).is_err());

        let key: GetKeyRequest =
            serde_json::from_str(r#"{"key_transfer_url":"https://kbs/keys/1"}"#).unwrap();
        assert!(key.attestation_token.is_empty());

        let infer = serde_json::to_value(InferResponse { high_risk: 1 }).unwrap();
        assert_eq!(infer, serde_json::json!({"high-risk": 1}));

        let version = serde_json::to_value(ServiceVersion::current()).unwrap();
        assert!(version.get("gitHash").is_some());
        assert_eq!(version["name"], SERVICE_NAME);
    }
}
