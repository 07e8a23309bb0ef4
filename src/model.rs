//! Protected model lifecycle
//!
//! The encrypted model lives on disk as `nonce || AES-GCM(DEK, model)`.
//! [`ModelStateMachine::decrypt`] runs the release pipeline
//!
//! ```text
//! wrapped SWK --RSA-OAEP--> SWK --AES-GCM--> DEK --AES-GCM--> plaintext model
//! ```
//!
//! and hands the plaintext to a [`ModelEngine`]. The plaintext only ever
//! lives inside the engine; [`ModelStateMachine::reset`] is what scrubs it.
//!
//! States: `Empty -> Decrypting -> Ready -> Empty`. Decrypt and reset hold
//! the write lock for their whole duration; execute holds the read lock, so
//! an execute never observes a model mid-decrypt or mid-reset.

use crate::error::{Result, WorkloadError};
use crate::keypair::EnvelopeKeyPair;
use crate::scrub::ScrubOnDrop;
use crate::sealed;
use crate::unwrap::{unwrap_symmetric_key, OaepDigest};
use rsa::RsaPrivateKey;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Inputs to the diabetes-risk classifier
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Features {
    pub pregnancies: f64,
    pub glucose: f64,
    pub blood_pressure: f64,
    pub skin_thickness: f64,
    pub insulin: f64,
    pub bmi: f64,
    pub dbf: f64,
    pub age: f64,
}

impl Features {
    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.pregnancies,
            self.glucose,
            self.blood_pressure,
            self.skin_thickness,
            self.insulin,
            self.bmi,
            self.dbf,
            self.age,
        ]
    }
}

pub const FEATURE_COUNT: usize = 8;

/// Inference backend that holds the plaintext model
pub trait ModelEngine: Send + Sync {
    /// Installs a decrypted model, replacing any resident one
    fn load_plaintext(&mut self, plaintext: Zeroizing<Vec<u8>>) -> Result<()>;

    /// Classifies `features` against the resident model
    fn predict(&self, features: &Features) -> Result<i32>;

    /// Discards and scrubs the resident model
    fn reset(&mut self);
}

/// Divisors that bring each feature into roughly `[0, 1]`
const NORMALIZATION: [f64; FEATURE_COUNT] = [28.0, 200.0, 125.0, 100.0, 850.0, 68.0, 2.45, 100.0];

/// Linear threshold classifier.
///
/// The plaintext model is ASCII: eight weights and a threshold, each
/// followed by a single space. A sample scores 1 when the dot product of the
/// normalized features and the weights exceeds the threshold.
#[derive(Default)]
pub struct LinearClassifier {
    plaintext: Option<Zeroizing<Vec<u8>>>,
    weights: Zeroizing<Vec<f64>>,
    threshold: f64,
}

impl LinearClassifier {
    fn parse(plaintext: &[u8]) -> Result<(Vec<f64>, f64)> {
        let text = std::str::from_utf8(plaintext)
            .map_err(|_| WorkloadError::Engine("model is not ASCII text".to_string()))?;

        // Only space-terminated tokens count
        let terminated = match text.rfind(' ') {
            Some(idx) => &text[..idx],
            None => "",
        };
        let mut values = terminated
            .split(' ')
            .map(|token| {
                token
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| WorkloadError::Engine(format!("invalid model token {:?}", token)))
            })
            .collect::<Result<Vec<f64>>>()?;

        if values.len() != FEATURE_COUNT + 1 {
            values.iter_mut().for_each(|v| *v = 0.0);
            return Err(WorkloadError::Engine(format!(
                "expected {} weights and a threshold, found {} values",
                FEATURE_COUNT,
                values.len()
            )));
        }
        let threshold = values.pop().unwrap_or_default();
        Ok((values, threshold))
    }
}

impl ModelEngine for LinearClassifier {
    fn load_plaintext(&mut self, plaintext: Zeroizing<Vec<u8>>) -> Result<()> {
        let (weights, threshold) = Self::parse(&plaintext)?;
        self.reset();
        self.weights = Zeroizing::new(weights);
        self.threshold = threshold;
        self.plaintext = Some(plaintext);
        Ok(())
    }

    fn predict(&self, features: &Features) -> Result<i32> {
        if self.plaintext.is_none() {
            return Err(WorkloadError::ModelNotReady);
        }

        let dot: f64 = features
            .to_array()
            .iter()
            .zip(NORMALIZATION.iter())
            .zip(self.weights.iter())
            .map(|((x, norm), w)| (x / norm) * w)
            .sum();

        Ok(i32::from(dot > self.threshold))
    }

    fn reset(&mut self) {
        if self.plaintext.take().is_some() {
            debug!("Dropped the decrypted model");
        } else {
            debug!("Model is already clean, nothing to reset");
        }
        self.weights = Zeroizing::new(Vec::new());
        self.threshold = 0.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Empty,
    Decrypting,
    Ready,
}

struct Resident {
    state: ModelState,
    engine: Box<dyn ModelEngine>,
}

/// Write access held for one decrypt.
///
/// Unless [`DecryptGuard::ready`] is reached, dropping the guard scrubs the
/// engine and leaves the machine `Empty`. This covers error returns and a
/// decrypt future dropped at an await point.
struct DecryptGuard<'a> {
    resident: RwLockWriteGuard<'a, Resident>,
    ready: bool,
}

impl<'a> DecryptGuard<'a> {
    fn new(mut resident: RwLockWriteGuard<'a, Resident>) -> Self {
        resident.state = ModelState::Decrypting;
        resident.engine.reset();
        Self {
            resident,
            ready: false,
        }
    }

    fn engine(&mut self) -> &mut dyn ModelEngine {
        self.resident.engine.as_mut()
    }

    fn ready(&mut self) {
        self.resident.state = ModelState::Ready;
        self.ready = true;
    }
}

impl Drop for DecryptGuard<'_> {
    fn drop(&mut self) {
        if !self.ready {
            self.resident.engine.reset();
            self.resident.state = ModelState::Empty;
        }
    }
}

/// Owns the protected model from "encrypted on disk" to "ready for inference"
pub struct ModelStateMachine {
    model_path: PathBuf,
    envelope: Arc<EnvelopeKeyPair>,
    digest: OaepDigest,
    resident: RwLock<Resident>,
}

impl ModelStateMachine {
    pub fn new(
        model_path: impl Into<PathBuf>,
        envelope: Arc<EnvelopeKeyPair>,
        digest: OaepDigest,
        engine: Box<dyn ModelEngine>,
    ) -> Self {
        Self {
            model_path: model_path.into(),
            envelope,
            digest,
            resident: RwLock::new(Resident {
                state: ModelState::Empty,
                engine,
            }),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub async fn state(&self) -> ModelState {
        self.resident.read().await.state
    }

    /// Releases the model with the broker's wrapped keys.
    ///
    /// Both wrapped buffers are zeroed before this returns. On any failure
    /// the machine is left `Empty` with nothing resident in the engine.
    pub async fn decrypt(&self, wrapped_swk: &mut [u8], wrapped_dek: &mut [u8]) -> Result<()> {
        let wrapped_swk = ScrubOnDrop::new(wrapped_swk);
        let wrapped_dek = ScrubOnDrop::new(wrapped_dek);
        let started = Instant::now();

        let mut resident = DecryptGuard::new(self.resident.write().await);

        let plaintext = match self.load_and_open(wrapped_swk, wrapped_dek).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(error = %e, "Model decryption failed");
                return Err(e);
            }
        };
        if let Err(e) = resident.engine().load_plaintext(plaintext) {
            warn!(error = %e, "Model decryption failed");
            return Err(e);
        }

        resident.ready();
        info!(
            path = %self.model_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model decrypted"
        );
        Ok(())
    }

    async fn load_and_open(
        &self,
        mut wrapped_swk: ScrubOnDrop<'_>,
        mut wrapped_dek: ScrubOnDrop<'_>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let encrypted = read_model(&self.model_path).await?;
        open_model(
            &encrypted,
            &mut wrapped_swk,
            &mut wrapped_dek,
            self.envelope.private_key(),
            self.digest,
        )
    }

    /// Runs the classifier; valid only in `Ready`
    pub async fn execute(&self, features: &Features) -> Result<i32> {
        let resident = self.resident.read().await;
        if resident.state != ModelState::Ready {
            return Err(WorkloadError::ModelNotReady);
        }
        resident.engine.predict(features)
    }

    /// Scrubs the resident model; valid from any state
    pub async fn reset(&self) -> Result<()> {
        let mut resident = self.resident.write().await;
        resident.engine.reset();
        resident.state = ModelState::Empty;
        info!("Model reset");
        Ok(())
    }
}

async fn read_model(path: &Path) -> Result<Vec<u8>> {
    let encrypted = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WorkloadError::ModelFileMissing(path.display().to_string()))
        }
        Err(e) => {
            return Err(WorkloadError::ModelUnreadable(format!(
                "{}: {}",
                path.display(),
                e
            )))
        }
    };

    if encrypted.is_empty() {
        return Err(WorkloadError::EmptyModel(path.display().to_string()));
    }
    Ok(encrypted)
}

/// SWK unwrap, DEK unwrap, model decrypt. Every intermediate key is scrubbed
/// when this returns, whichever stage fails.
pub fn open_model(
    encrypted_model: &[u8],
    wrapped_swk: &mut [u8],
    wrapped_dek: &mut [u8],
    private_key: &RsaPrivateKey,
    digest: OaepDigest,
) -> Result<Zeroizing<Vec<u8>>> {
    let wrapped_dek = ScrubOnDrop::new(wrapped_dek);

    let mut swk = unwrap_symmetric_key(wrapped_swk, private_key, digest)
        .map_err(|e| e.in_stage("unwrap swk"))?;
    let mut dek = sealed::open(&mut swk, &wrapped_dek).map_err(|e| e.in_stage("decrypt dek"))?;
    sealed::open(&mut dek, encrypted_model).map_err(|e| e.in_stage("decrypt model"))
}
