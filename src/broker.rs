//! Key broker client
//!
//! The broker releases the wrapped keys for a model only after it has
//! validated attestation evidence. The exchange has two phases against the
//! same key-transfer URL:
//!
//! 1. **Challenge**: an unauthenticated `POST` returns a verifier nonce in
//!    the body and the expected attestation scheme in the
//!    `Attestation-Type` header.
//! 2. **Transfer**: a second `POST` carries either an attestation token or
//!    a quote + nonce + user-data triple, and returns the wrapped SWK and
//!    the wrapped DEK.
//!
//! The client keeps no nonce state between calls and never retries: a
//! nonce is single use, so a retry has to start again from a new challenge.

use crate::encoding::{base64_bytes, option_base64_bytes};
use crate::error::{Result, WorkloadError};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_ATTESTATION_TYPE: &str = "Attestation-Type";
const APPLICATION_JSON: &str = "application/json";

/// Freshness value issued by the verifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierNonce {
    #[serde(with = "base64_bytes")]
    pub val: Vec<u8>,
    /// Issuance time
    #[serde(with = "base64_bytes")]
    pub iat: Vec<u8>,
    #[serde(
        default,
        with = "option_base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub signature: Option<Vec<u8>>,
}

impl VerifierNonce {
    /// Bytes bound into the quote: `val || iat`
    pub fn quote_nonce(&self) -> Vec<u8> {
        let mut nonce = Vec::with_capacity(self.val.len() + self.iat.len());
        nonce.extend_from_slice(&self.val);
        nonce.extend_from_slice(&self.iat);
        nonce
    }
}

/// Raw response to the challenge phase
#[derive(Debug, Clone)]
pub struct Challenge {
    pub body: Vec<u8>,
    pub attestation_type: Option<String>,
}

impl Challenge {
    /// Interprets the body as a verifier nonce
    pub fn nonce(&self) -> Result<VerifierNonce> {
        serde_json::from_slice(&self.body)
            .map_err(|e| WorkloadError::Protocol(format!("could not unmarshal nonce: {}", e)))
    }
}

/// Body of the evidence-bearing transfer request
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyTransferRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_token: Option<String>,
    #[serde(with = "option_base64_bytes", skip_serializing_if = "Option::is_none")]
    pub quote: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<VerifierNonce>,
    #[serde(with = "option_base64_bytes", skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Vec<u8>>,
    #[serde(with = "option_base64_bytes", skip_serializing_if = "Option::is_none")]
    pub event_log: Option<Vec<u8>>,
}

impl KeyTransferRequest {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            attestation_token: Some(token.into()),
            ..Default::default()
        }
    }

    /// Takes the nonce by value; it cannot be sent again from here
    pub fn with_evidence(quote: Vec<u8>, nonce: VerifierNonce, user_data: Vec<u8>) -> Self {
        Self {
            quote: Some(quote),
            nonce: Some(nonce),
            user_data: Some(user_data),
            ..Default::default()
        }
    }
}

/// Keys released by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTransferResponse {
    /// Wrapped DEK: `nonce || AES-GCM(SWK, DEK)`
    #[serde(with = "base64_bytes")]
    pub wrapped_key: Vec<u8>,
    /// SWK wrapped with RSA-OAEP to the envelope public key
    #[serde(with = "base64_bytes")]
    pub wrapped_swk: Vec<u8>,
}

/// HTTP client for one key-transfer URL
#[derive(Debug, Clone)]
pub struct KeyBrokerClient {
    http: Client,
    url: Url,
    api_key: String,
}

impl KeyBrokerClient {
    pub fn new(http: Client, url: Url, api_key: impl Into<String>) -> Self {
        Self {
            http,
            url,
            api_key: api_key.into(),
        }
    }

    /// Phase one: fetches the challenge for this key
    pub async fn challenge(&self) -> Result<Challenge> {
        info!(url = %self.url, "Requesting key transfer challenge");

        let request = self
            .http
            .post(self.url.clone())
            .header(HEADER_API_KEY, &self.api_key)
            .header(ACCEPT, APPLICATION_JSON);

        let (headers, body) = self.send(request).await?;
        let attestation_type = headers
            .get(HEADER_ATTESTATION_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        debug!(
            body_len = body.len(),
            attestation_type = ?attestation_type,
            "Received challenge"
        );
        Ok(Challenge {
            body,
            attestation_type,
        })
    }

    /// Phase two: exchanges evidence or a token for the wrapped keys
    pub async fn transfer_key_with_evidence(
        &self,
        request: &KeyTransferRequest,
    ) -> Result<KeyTransferResponse> {
        info!(
            url = %self.url,
            with_token = request.attestation_token.is_some(),
            quote_len = request.quote.as_ref().map_or(0, Vec::len),
            "Requesting key transfer"
        );

        let payload = serde_json::to_vec(request)?;
        let builder = self
            .http
            .post(self.url.clone())
            .header(CONTENT_TYPE, APPLICATION_JSON)
            .header(ACCEPT, APPLICATION_JSON)
            .body(payload);

        let (_, body) = self.send(builder).await?;
        let response: KeyTransferResponse = serde_json::from_slice(&body).map_err(|e| {
            WorkloadError::Protocol(format!("invalid key transfer response: {}", e))
        })?;

        info!(
            wrapped_swk_len = response.wrapped_swk.len(),
            wrapped_dek_len = response.wrapped_key.len(),
            "Key transfer complete"
        );
        Ok(response)
    }

    /// Sends a request and enforces "200 with a non-empty body"
    async fn send(&self, request: RequestBuilder) -> Result<(reqwest::header::HeaderMap, Vec<u8>)> {
        let response = request
            .send()
            .await
            .map_err(|e| WorkloadError::Protocol(format!("broker request failed: {}", e)))?;

        let status = response.status();
        let content_length = response.content_length();
        if status != StatusCode::OK || content_length == Some(0) {
            return Err(WorkloadError::Protocol(format!(
                "Invalid response: StatusCode = {}, ContentLength = {}",
                status.as_u16(),
                content_length.map_or(-1, |l| l as i64)
            )));
        }

        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| WorkloadError::Protocol(format!("could not read broker response: {}", e)))?;
        if body.is_empty() {
            return Err(WorkloadError::Protocol("empty broker response".to_string()));
        }

        Ok((headers, body.to_vec()))
    }
}
