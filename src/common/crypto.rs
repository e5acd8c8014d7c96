/*
 * This file is part of the Tarhely Storage Engine.
 *
 * Copyright (C) 2025 Kovács Dávid <kapcsolat@kovacsdavid.dev>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Secrets-at-rest encryption for catalog columns.
//!
//! Tenant database URLs, JWT secrets, service keys, JWK material and S3
//! secret keys are sealed with AES-256-GCM before they reach the
//! multitenant database. Ciphertext layout is
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`, base64-encoded for
//! TEXT columns. A fresh 96-bit nonce is generated per write.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// 12-byte nonce plus 16-byte GCM tag.
const MIN_CIPHERTEXT_LEN: usize = 12 + 16;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    #[error("Invalid base64 ciphertext: {0}")]
    Encoding(String),
}

/// A 256-bit key derived from the deployment's `ENCRYPTION_KEY` setting.
///
/// The inner bytes are never exposed in `Debug` output.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Derive the key from the configured passphrase. SHA-256 maps the
    /// operator-supplied string onto exactly 32 bytes.
    pub fn derive(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt a secret for storage in a TEXT column.
pub fn encrypt(key: &EncryptionKey, plaintext: &str) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(combined))
}

/// Decrypt a column value produced by [`encrypt`].
///
/// Authentication failure (wrong key, corrupted data, tampered tag)
/// surfaces as [`CryptoError::Decryption`].
pub fn decrypt(key: &EncryptionKey, encoded: &str) -> Result<String, CryptoError> {
    let combined = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::Decryption(e.to_string()))
}

impl From<CryptoError> for crate::common::error::RepositoryError {
    fn from(value: CryptoError) -> Self {
        crate::common::error::RepositoryError::Encryption(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = EncryptionKey::derive("test-encryption-key");
        let ciphertext = encrypt(&key, "postgres://tenant:secret@db/t1").unwrap();
        assert_eq!(
            decrypt(&key, &ciphertext).unwrap(),
            "postgres://tenant:secret@db/t1"
        );
    }

    #[test]
    fn fresh_nonce_per_write() {
        let key = EncryptionKey::derive("test-encryption-key");
        let a = encrypt(&key, "same-plaintext").unwrap();
        let b = encrypt(&key, "same-plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let key = EncryptionKey::derive("test-encryption-key");
        let other = EncryptionKey::derive("another-key");
        let ciphertext = encrypt(&key, "secret").unwrap();
        assert!(matches!(
            decrypt(&other, &ciphertext),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = EncryptionKey::derive("test-encryption-key");
        let short = BASE64.encode([0u8; 8]);
        assert!(matches!(
            decrypt(&key, &short),
            Err(CryptoError::CiphertextTooShort { .. })
        ));
    }
}
