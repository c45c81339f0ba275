//! Authenticated encryption of the tenant setup password.
//!
//! Passwords are stored as `iv:tag:ciphertext` (hex segments) under
//! AES-256-GCM. The format keeps the authentication tag separate so a
//! truncated or spliced value fails decryption instead of yielding garbage.

use crate::error::{ApiError, ApiResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Symmetric cipher over the tenant setup password.
#[derive(Clone)]
pub struct PasswordCipher {
    cipher: Aes256Gcm,
}

impl PasswordCipher {
    /// Creates a cipher from a 32-byte key.
    pub fn new(key: &[u8]) -> ApiResult<Self> {
        if key.len() != 32 {
            return Err(ApiError::Internal(format!(
                "password key must be 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| ApiError::Internal(format!("invalid password key: {e}")))?;
        Ok(Self { cipher })
    }

    /// Encrypts a password to `iv:tag:ciphertext` hex.
    pub fn encrypt(&self, plaintext: &str) -> ApiResult<String> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| ApiError::Internal("password encryption failed".into()))?;

        // aes-gcm appends the tag to the ciphertext; split it back out.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypts an `iv:tag:ciphertext` hex value.
    pub fn decrypt(&self, stored: &str) -> ApiResult<String> {
        let mut parts = stored.split(':');
        let (iv, tag, ciphertext) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(iv), Some(tag), Some(ct), None) => (iv, tag, ct),
            _ => {
                return Err(ApiError::Internal(
                    "invalid encrypted password format".into(),
                ))
            }
        };

        let iv = hex::decode(iv)
            .map_err(|_| ApiError::Internal("invalid encrypted password format".into()))?;
        let tag = hex::decode(tag)
            .map_err(|_| ApiError::Internal("invalid encrypted password format".into()))?;
        let mut sealed = hex::decode(ciphertext)
            .map_err(|_| ApiError::Internal("invalid encrypted password format".into()))?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(ApiError::Internal(
                "invalid encrypted password format".into(),
            ));
        }
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_ref())
            .map_err(|_| ApiError::Internal("password decryption failed".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| ApiError::Internal("password decryption failed".into()))
    }
}
