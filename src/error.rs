//! Error types for the model workload

use thiserror::Error;

/// Errors that can occur anywhere in the key-release pipeline or service
#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("Key broker protocol error: {0}")]
    Protocol(String),

    #[error("Evidence generation failed: {0}")]
    EvidenceGeneration(String),

    #[error("Key unwrap failed: {0}")]
    KeyUnwrap(String),

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid symmetric key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("Model file does not exist: {0}")]
    ModelFileMissing(String),

    #[error("Model file unreadable: {0}")]
    ModelUnreadable(String),

    #[error("Model file is empty: {0}")]
    EmptyModel(String),

    #[error("Model is not decrypted")]
    ModelNotReady,

    #[error("Model engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkloadError {
    /// Prefixes the message with the pipeline stage that produced it,
    /// keeping the variant intact so callers can still match on it.
    pub fn in_stage(self, stage: &str) -> Self {
        match self {
            Self::Protocol(m) => Self::Protocol(format!("{stage}: {m}")),
            Self::EvidenceGeneration(m) => Self::EvidenceGeneration(format!("{stage}: {m}")),
            Self::KeyUnwrap(m) => Self::KeyUnwrap(format!("{stage}: {m}")),
            Self::InvalidCiphertext(m) => Self::InvalidCiphertext(format!("{stage}: {m}")),
            Self::Decryption(m) => Self::Decryption(format!("{stage}: {m}")),
            Self::Engine(m) => Self::Engine(format!("{stage}: {m}")),
            other => other,
        }
    }

    /// HTTP status the transport reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::Serialization(_) => 400,
            Self::ModelNotReady => 409,
            Self::UnsupportedMediaType(_) => 415,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkloadError>;
