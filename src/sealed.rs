//! AES-GCM envelope format: `nonce (12 bytes) || ciphertext || tag`
//!
//! Used twice while releasing a model: the wrapped DEK is opened under the
//! SWK, then the encrypted model is opened under the DEK. AES-128 and
//! AES-256 keys are accepted; the key length selects the algorithm.

use crate::error::{Result, WorkloadError};
use crate::scrub::ScrubOnDrop;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;
use zeroize::Zeroizing;

fn aead_key(key: &[u8]) -> Result<LessSafeKey> {
    let algorithm = match key.len() {
        16 => &AES_128_GCM,
        32 => &AES_256_GCM,
        other => return Err(WorkloadError::InvalidKeyLength(other)),
    };
    let unbound =
        UnboundKey::new(algorithm, key).map_err(|_| WorkloadError::InvalidKeyLength(key.len()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Opens `sealed` under `key`.
///
/// `key` is zeroed before this returns in every case. Input shorter than
/// the nonce is [`WorkloadError::InvalidCiphertext`]; a tag mismatch (or a
/// body too short to carry a tag) is [`WorkloadError::Decryption`].
pub fn open(key: &mut [u8], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let key = ScrubOnDrop::new(key);

    if sealed.len() < NONCE_LEN {
        return Err(WorkloadError::InvalidCiphertext(format!(
            "input is {} bytes, shorter than the {}-byte nonce",
            sealed.len(),
            NONCE_LEN
        )));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

    let aead = aead_key(&key)?;
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| WorkloadError::InvalidCiphertext("malformed nonce".to_string()))?;

    let mut buf = Zeroizing::new(ciphertext.to_vec());
    let plaintext_len = aead
        .open_in_place(nonce, Aad::empty(), buf.as_mut_slice())
        .map_err(|_| WorkloadError::Decryption("authentication failed".to_string()))?
        .len();
    buf.truncate(plaintext_len);

    debug!(plaintext_len = plaintext_len, "Opened AES-GCM envelope");
    Ok(buf)
}

/// Seals `plaintext` under `key` with a random nonce.
///
/// The output buffer is sized for nonce, body and tag up front and the body
/// is encrypted in place, so it never reallocates while holding plaintext.
/// The input buffer is zeroed on return.
pub fn seal(key: &[u8], plaintext: Vec<u8>) -> Result<Vec<u8>> {
    let plaintext = Zeroizing::new(plaintext);
    let aead = aead_key(key)?;
    let tag_len = aead.algorithm().tag_len();

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| WorkloadError::Config("system random unavailable".to_string()))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut out = Zeroizing::new(Vec::with_capacity(NONCE_LEN + plaintext.len() + tag_len));
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&plaintext);

    let tag = aead
        .seal_in_place_separate_tag(nonce, Aad::empty(), &mut out[NONCE_LEN..])
        .map_err(|_| WorkloadError::Config("AES-GCM seal failed".to_string()))?;
    out.extend_from_slice(tag.as_ref());

    Ok(std::mem::take(&mut *out))
}
