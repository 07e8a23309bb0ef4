//! RSA-OAEP unwrapping of the symmetric wrapping key (SWK)
//!
//! The key broker wraps the SWK to the workload's envelope public key with
//! RSA-OAEP and no label. The digest is fixed per deployment and must match
//! the wrapping side exactly; see [`OaepDigest`].

use crate::error::{Result, WorkloadError};
use crate::scrub::ScrubOnDrop;
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey};
use sha2::{Sha256, Sha384};
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use zeroize::Zeroizing;

/// OAEP hash/MGF1 digest shared with the key broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OaepDigest {
    #[default]
    Sha256,
    Sha384,
}

impl OaepDigest {
    fn padding(self) -> Oaep {
        match self {
            Self::Sha256 => Oaep::new::<Sha256>(),
            Self::Sha384 => Oaep::new::<Sha384>(),
        }
    }
}

impl FromStr for OaepDigest {
    type Err = WorkloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            other => Err(WorkloadError::Config(format!(
                "Unsupported OAEP digest: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for OaepDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha384 => f.write_str("sha384"),
        }
    }
}

/// Unwraps `wrapped_key` with a private key that stays in use afterwards.
///
/// `wrapped_key` is zeroed before this returns, on success and on failure.
/// Every cryptographic failure is reported as the same generic
/// [`WorkloadError::KeyUnwrap`].
pub fn unwrap_symmetric_key(
    wrapped_key: &mut [u8],
    private_key: &RsaPrivateKey,
    digest: OaepDigest,
) -> Result<Zeroizing<Vec<u8>>> {
    let wrapped_key = ScrubOnDrop::new(wrapped_key);

    let key = private_key
        .decrypt_blinded(&mut OsRng, digest.padding(), &wrapped_key)
        .map_err(|_| WorkloadError::KeyUnwrap("RSA-OAEP decryption failed".to_string()))?;

    debug!(digest = %digest, key_len = key.len(), "Unwrapped symmetric key");
    Ok(Zeroizing::new(key))
}

/// Unwraps with a single-use private key whose secret scalars are zeroized
/// when it is dropped at the end of this call.
pub fn unwrap_symmetric_key_once(
    wrapped_key: &mut [u8],
    private_key: RsaPrivateKey,
    digest: OaepDigest,
) -> Result<Zeroizing<Vec<u8>>> {
    unwrap_symmetric_key(wrapped_key, &private_key, digest)
}
