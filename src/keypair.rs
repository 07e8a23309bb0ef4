//! Envelope key pair held by the workload
//!
//! The workload generates an RSA key pair at start-up. The public half is
//! bound into attestation evidence as user data, so the key broker wraps the
//! symmetric wrapping key (SWK) to it; the private half unwraps that SWK.
//!
//! Public key wire format: 4-byte little-endian exponent followed by the
//! big-endian modulus, no length prefix.

use crate::error::{Result, WorkloadError};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

/// Modulus size used for the workload's envelope key
pub const ENVELOPE_KEY_BITS: usize = 3072;

const EXPONENT_LEN: usize = 4;

/// The workload's RSA identity
pub struct EnvelopeKeyPair {
    private_key: RsaPrivateKey,
    public_key_bytes: Vec<u8>,
}

impl EnvelopeKeyPair {
    /// Generates a fresh in-memory key pair of [`ENVELOPE_KEY_BITS`]
    pub fn generate() -> Result<Self> {
        Self::generate_with_bits(ENVELOPE_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| WorkloadError::Config(format!("Failed to generate envelope key: {}", e)))?;
        let key_pair = Self::from_private_key(private_key)?;

        info!(
            bits = bits,
            fingerprint = %key_pair.fingerprint(),
            "Envelope key pair generated"
        );
        Ok(key_pair)
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let public_key_bytes = encode_public_key(&private_key.to_public_key())?;
        Ok(Self {
            private_key,
            public_key_bytes,
        })
    }

    /// Loads a PEM private key (PKCS#8 or PKCS#1) from disk.
    ///
    /// The file contents are held in zeroizing storage and scrubbed before
    /// this returns.
    pub fn load(path: &Path) -> Result<Self> {
        let pem = Zeroizing::new(std::fs::read_to_string(path)?);
        let private_key = parse_private_key_pem(&pem)?;
        info!(path = %path.display(), "Envelope private key loaded");
        Self::from_private_key(private_key)
    }

    /// Writes the private key as PKCS#1 PEM, readable by the owner only
    pub fn persist(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        let pem = self
            .private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| WorkloadError::Config(format!("Failed to encode private key: {}", e)))?;

        let mut options = std::fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // mode() only applies when the file is created
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(pem.as_bytes())?;
        file.sync_all()?;

        info!(path = %path.display(), "Envelope private key persisted");
        Ok(())
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// Public key in the exponent || modulus wire format
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key_bytes
    }

    /// SHA-256 of the public key bytes, hex-encoded, for logs
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.public_key_bytes))
    }
}

/// Encodes `key` as 4-byte little-endian exponent followed by the big-endian modulus
pub fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>> {
    let mut exponent = key.e().to_bytes_le();
    if exponent.len() > EXPONENT_LEN {
        return Err(WorkloadError::Config(format!(
            "RSA public exponent does not fit in {} bytes",
            EXPONENT_LEN
        )));
    }
    exponent.resize(EXPONENT_LEN, 0);

    let modulus = key.n().to_bytes_be();
    let mut out = Vec::with_capacity(EXPONENT_LEN + modulus.len());
    out.extend_from_slice(&exponent);
    out.extend_from_slice(&modulus);
    Ok(out)
}

/// Parses a PEM private key, accepting PKCS#8 ("PRIVATE KEY") or
/// PKCS#1 ("RSA PRIVATE KEY") framing
pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|_| WorkloadError::KeyUnwrap("Error decoding private envelope key".to_string()))
}
