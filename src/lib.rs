//! TDX Model Workload - attestation-gated key release for a protected model
//!
//! This library provides the workload's core functionality, including:
//! - Envelope RSA key pair whose public half is bound into attestation evidence
//! - Key broker client for the challenge / evidence / key-transfer exchange
//! - RSA-OAEP key unwrap and AES-GCM envelope decryption with zeroization
//! - A lock-guarded model state machine gating inference on a decrypted model
//! - JSON over HTTP transport for the service operations

pub mod broker;
pub mod config;
pub mod encoding;
pub mod error;
pub mod evidence;
pub mod http;
pub mod keypair;
pub mod model;
pub mod scrub;
pub mod sealed;
pub mod service;
pub mod unwrap;

#[cfg(test)]
mod test_helpers;

pub use error::{Result, WorkloadError};
pub use keypair::EnvelopeKeyPair;
pub use model::{LinearClassifier, ModelEngine, ModelState, ModelStateMachine};
pub use service::WorkloadService;
pub use unwrap::OaepDigest;
