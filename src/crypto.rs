//! Token sealing with AES-256-GCM
//!
//! A sealed token is `version | nonce | ciphertext+tag`. Every token is bound
//! to the credential that owns it through [`TokenBinding`], which becomes the
//! additional authenticated data, so a blob copied onto another row fails to
//! open.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const ENVELOPE_V1: u8 = 0x01;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("unsupported ciphertext version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// 256-bit key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(Self(bytes))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

/// Owner of a sealed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBinding {
    pub user_id: Uuid,
    pub link_id: Uuid,
}

impl TokenBinding {
    pub fn new(user_id: Uuid, link_id: Uuid) -> Self {
        Self { user_id, link_id }
    }

    fn aad(&self) -> Vec<u8> {
        format!("{}|{}", self.user_id, self.link_id).into_bytes()
    }
}

/// Borrowed view of a sealed token.
struct Envelope<'a> {
    nonce: &'a [u8],
    sealed: &'a [u8],
}

impl<'a> Envelope<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self, CryptoError> {
        let (&version, rest) = bytes.split_first().ok_or(CryptoError::EmptyCiphertext)?;
        if version != ENVELOPE_V1 {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        if rest.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::InvalidFormat);
        }
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        Ok(Self { nonce, sealed })
    }
}

/// Seals and opens OAuth tokens under one key.
#[derive(Debug, Clone)]
pub struct TokenCipher {
    key: CryptoKey,
}

impl TokenCipher {
    pub fn new(key: CryptoKey) -> Self {
        Self { key }
    }

    pub fn seal(&self, binding: &TokenBinding, token: &str) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let aad = binding.aad();
        let ciphertext = self
            .key
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: token.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        envelope.push(ENVELOPE_V1);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// The plaintext is wiped when the returned value drops.
    pub fn open(
        &self,
        binding: &TokenBinding,
        sealed: &[u8],
    ) -> Result<Zeroizing<String>, CryptoError> {
        let envelope = Envelope::parse(sealed)?;
        let aad = binding.aad();
        let plaintext = Zeroizing::new(
            self.key
                .cipher()
                .decrypt(
                    Nonce::from_slice(envelope.nonce),
                    Payload {
                        msg: envelope.sealed,
                        aad: &aad,
                    },
                )
                .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?,
        );

        let token = std::str::from_utf8(&plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("token is not UTF-8: {}", e)))?;
        Ok(Zeroizing::new(token.to_owned()))
    }
}
