//! Symmetric payload encryption.
//!
//! Payloads are sealed with AES-256-GCM. The key is the SHA-256 digest of the
//! configured secret and every call draws a fresh random nonce, which is
//! prepended to the output so decryption needs nothing but the secret:
//!
//! ```text
//! nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```

use std::fmt;

use ring::{
    aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey},
    digest::{SHA256, digest},
    rand::{SecureRandom, SystemRandom},
};

use crate::Error;

/// Shortest secret accepted by [`EncryptionCodec::new`], in bytes.
pub const MIN_SECRET_LEN: usize = 32;

const TAG_LEN: usize = 16;

pub struct EncryptionCodec {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl fmt::Debug for EncryptionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionCodec").finish_non_exhaustive()
    }
}

impl EncryptionCodec {
    /// Builds a codec from a shared secret.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the secret is shorter than
    /// [`MIN_SECRET_LEN`] bytes.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, Error> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::Configuration(format!(
                "encryption secret must be at least {MIN_SECRET_LEN} bytes, got {}",
                secret.len()
            )));
        }

        let key_material = digest(&SHA256, secret);
        let unbound = UnboundKey::new(&AES_256_GCM, key_material.as_ref())
            .map_err(|_| Error::Configuration("failed to derive encryption key".into()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Encrypts `plaintext` under a freshly generated nonce.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if the system RNG or the cipher fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Encryption("failed to generate nonce".into()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::Encryption("AES-GCM seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    /// Decrypts output of [`EncryptionCodec::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Decryption` if the input is truncated, was tampered
    /// with, or was sealed under a different secret.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Decryption(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::Decryption("invalid nonce".into()))?;

        let mut in_out = sealed.to_vec();
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::Decryption("authentication failed".into()))?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }
}
