//! Payload compression and encryption
//!
//! Sealing turns a JSON value into an [`Envelope`]: the value is serialized,
//! optionally LZ4-compressed (size-prepended), optionally AES-256-GCM
//! encrypted with a random 12-byte nonce prepended to the ciphertext, and
//! finally base64-encoded into `data`. Opening reverses the steps according
//! to the envelope flags, so no side metadata is needed.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;

use crate::entry::Envelope;

const NONCE_LEN: usize = 12;

/// Seals and opens cache envelopes
pub struct PayloadTransformer {
    cipher: Option<Aes256Gcm>,
}

impl fmt::Debug for PayloadTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadTransformer")
            .field("encryption", &self.cipher.is_some())
            .finish()
    }
}

impl PayloadTransformer {
    /// Create a transformer; without a key, encryption is unavailable
    #[must_use]
    pub fn new(key: Option<&[u8; 32]>) -> Self {
        let cipher = key.map(|k| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k)));
        Self { cipher }
    }

    #[must_use]
    pub fn can_encrypt(&self) -> bool {
        self.cipher.is_some()
    }

    /// Build the envelope for `data`.
    ///
    /// # Errors
    ///
    /// Fails if encryption is requested without a key, or serialization or
    /// encryption fails.
    pub fn seal(&self, data: serde_json::Value, compress: bool, encrypt: bool) -> Result<Envelope> {
        if !compress && !encrypt {
            return Ok(Envelope::plain(data));
        }

        let mut bytes = serde_json::to_vec(&data).context("Failed to serialize payload")?;
        if compress {
            bytes = compress_prepend_size(&bytes);
        }
        if encrypt {
            let cipher = self
                .cipher
                .as_ref()
                .context("encryption requested but no key is configured")?;
            let mut nonce_bytes = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce_bytes);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce_bytes), bytes.as_slice())
                .map_err(|_| anyhow!("payload encryption failed"))?;
            let mut sealed = nonce_bytes.to_vec();
            sealed.extend_from_slice(&ciphertext);
            bytes = sealed;
        }

        Ok(Envelope {
            compressed: compress,
            encrypted: encrypt,
            data: serde_json::Value::String(STANDARD.encode(bytes)),
        })
    }

    /// Recover the original value from an envelope.
    ///
    /// # Errors
    ///
    /// Fails on malformed base64, a missing key, an authentication failure or
    /// corrupt compressed data.
    pub fn open(&self, envelope: &Envelope) -> Result<serde_json::Value> {
        if !envelope.is_transformed() {
            return Ok(envelope.data.clone());
        }

        let encoded = envelope
            .data
            .as_str()
            .context("transformed payload is not a string")?;
        let mut bytes = STANDARD.decode(encoded).context("payload is not valid base64")?;

        if envelope.encrypted {
            let cipher = self
                .cipher
                .as_ref()
                .context("payload is encrypted but no key is configured")?;
            if bytes.len() < NONCE_LEN {
                bail!("encrypted payload too short");
            }
            let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
            bytes = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| anyhow!("payload decryption failed"))?;
        }
        if envelope.compressed {
            bytes = decompress_size_prepended(&bytes).context("payload decompression failed")?;
        }

        serde_json::from_slice(&bytes).context("Failed to deserialize payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: [u8; 32] = [7u8; 32];

    fn sample() -> serde_json::Value {
        json!({"student": "Ana", "notes": "x".repeat(2048), "scores": [1, 2, 3]})
    }

    #[test]
    fn test_plain_is_untouched() {
        let t = PayloadTransformer::new(None);
        let env = t.seal(sample(), false, false).unwrap();
        assert!(!env.is_transformed());
        assert_eq!(t.open(&env).unwrap(), sample());
    }

    #[test]
    fn test_compress_encrypt_roundtrip() {
        let t = PayloadTransformer::new(Some(&KEY));
        for (compress, encrypt) in [(true, false), (false, true), (true, true)] {
            let env = t.seal(sample(), compress, encrypt).unwrap();
            assert_eq!(env.compressed, compress);
            assert_eq!(env.encrypted, encrypt);
            assert!(env.data.is_string());
            assert_eq!(t.open(&env).unwrap(), sample());
        }
    }

    #[test]
    fn test_compression_shrinks_repetitive_payload() {
        let t = PayloadTransformer::new(None);
        let env = t.seal(sample(), true, false).unwrap();
        let raw = serde_json::to_vec(&sample()).unwrap().len();
        assert!(env.data.as_str().unwrap().len() < raw);
    }

    #[test]
    fn test_encrypt_without_key_fails() {
        let t = PayloadTransformer::new(None);
        assert!(t.seal(sample(), false, true).is_err());
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let env = PayloadTransformer::new(Some(&KEY)).seal(sample(), false, true).unwrap();
        let other = PayloadTransformer::new(Some(&[9u8; 32]));
        assert!(other.open(&env).is_err());
    }
}
