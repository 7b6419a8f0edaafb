//! AES-256-GCM codec for encrypted database fields.
//!
//! Every value gets a fresh random 128-bit nonce. The stored form is a
//! small JSON envelope of base64 members so a column can be inspected,
//! migrated, or re-keyed without guessing at byte offsets:
//!
//! ```json
//! {"nonce":"...","ciphertext":"...","tag":"..."}
//! ```
//!
//! Decryption authenticates the whole envelope; any bit flip in any
//! member fails closed with [`CryptoError::AuthenticationFailed`].

use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit},
    aes::Aes256,
    AesGcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// AES-256-GCM with a 16-byte nonce.
type FieldCipher = AesGcm<Aes256, U16>;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

/// Placeholder surfaced to readers when a stored field cannot be
/// decrypted. Must be treated as absent, never as field content.
pub const DECRYPT_FAILED_SENTINEL: &str = "[decryption error]";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid nonce length: expected {expected} bytes, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("malformed encrypted envelope: {0}")]
    MalformedEnvelope(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("decrypted value is not valid UTF-8")]
    InvalidPlaintext(#[from] std::string::FromUtf8Error),
}

/// Stored representation of one encrypted value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedField {
    pub nonce: String,
    pub ciphertext: String,
    pub tag: String,
}

impl EncryptedField {
    pub fn to_json(&self) -> String {
        // Serialization of three strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(raw).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }
}

/// Encrypts and decrypts individual field values with a single
/// process-wide key.
#[derive(Clone)]
pub struct FieldCodec {
    cipher: FieldCipher,
}

impl FieldCodec {
    /// Build a codec from a raw 32-byte key. Wrong-length keys are fatal
    /// here so nothing downstream runs with a broken codec.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let cipher =
            FieldCipher::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            })?;
        Ok(Self { cipher })
    }

    /// Encrypt a value under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedField, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<U16>::from_slice(&nonce_bytes);

        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        // The AEAD appends the tag; store it as its own member.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedField {
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(&sealed),
            tag: BASE64.encode(&tag),
        })
    }

    /// Decrypt and authenticate one envelope.
    pub fn decrypt(&self, field: &EncryptedField) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = BASE64
            .decode(&field.nonce)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_LEN,
                actual: nonce_bytes.len(),
            });
        }

        let mut sealed = BASE64
            .decode(&field.ciphertext)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("ciphertext: {}", e)))?;
        let tag = BASE64
            .decode(&field.tag)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("tag: {}", e)))?;
        if tag.len() != TAG_LEN {
            return Err(CryptoError::MalformedEnvelope(format!(
                "tag must be {} bytes, got {}",
                TAG_LEN,
                tag.len()
            )));
        }
        sealed.extend_from_slice(&tag);

        let nonce = Nonce::<U16>::from_slice(&nonce_bytes);
        self.cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Encrypt a string and return the JSON envelope for a TEXT column.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        Ok(self.encrypt(plaintext.as_bytes())?.to_json())
    }

    /// Decrypt a stored JSON envelope back to a string.
    pub fn decrypt_str(&self, stored: &str) -> Result<String, CryptoError> {
        let field = EncryptedField::from_json(stored)?;
        let plaintext = self.decrypt(&field)?;
        Ok(String::from_utf8(plaintext)?)
    }

    /// Read path for display: a field that fails to decrypt degrades to
    /// [`DECRYPT_FAILED_SENTINEL`] instead of failing the whole read.
    pub fn decrypt_or_sentinel(&self, stored: &str) -> String {
        match self.decrypt_str(stored) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(error = %e, "Failed to decrypt stored field");
                DECRYPT_FAILED_SENTINEL.to_string()
            }
        }
    }
}

impl std::fmt::Debug for FieldCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCodec").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_codec() -> FieldCodec {
        FieldCodec::new(&[0x42u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let codec = test_codec();
        let envelope = codec.encrypt(b"confidential terms").unwrap();
        let plaintext = codec.decrypt(&envelope).unwrap();
        assert_eq!(plaintext, b"confidential terms");
    }

    #[test]
    fn test_round_trip_empty_string() {
        let codec = test_codec();
        let stored = codec.encrypt_str("").unwrap();
        assert_eq!(codec.decrypt_str(&stored).unwrap(), "");
    }

    #[test]
    fn test_round_trip_unicode() {
        let codec = test_codec();
        let stored = codec.encrypt_str("条款 – ценные условия 🤝").unwrap();
        assert_eq!(codec.decrypt_str(&stored).unwrap(), "条款 – ценные условия 🤝");
    }

    #[test]
    fn test_nonce_is_unique_per_encryption() {
        let codec = test_codec();
        let a = codec.encrypt(b"same input").unwrap();
        let b = codec.encrypt(b"same input").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_envelope_shape() {
        let codec = test_codec();
        let envelope = codec.encrypt(b"abc").unwrap();
        assert_eq!(BASE64.decode(&envelope.nonce).unwrap().len(), NONCE_LEN);
        assert_eq!(BASE64.decode(&envelope.tag).unwrap().len(), TAG_LEN);
        assert_eq!(BASE64.decode(&envelope.ciphertext).unwrap().len(), 3);

        let parsed: serde_json::Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert!(parsed.get("nonce").is_some());
        assert!(parsed.get("ciphertext").is_some());
        assert!(parsed.get("tag").is_some());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let codec = test_codec();
        let envelope = codec.encrypt(b"payload under test").unwrap();

        let mut bytes = BASE64.decode(&envelope.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        let tampered = EncryptedField {
            ciphertext: BASE64.encode(&bytes),
            ..envelope
        };

        assert!(matches!(
            codec.decrypt(&tampered),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let codec = test_codec();
        let envelope = codec.encrypt(b"payload under test").unwrap();

        let mut bytes = BASE64.decode(&envelope.tag).unwrap();
        bytes[TAG_LEN - 1] ^= 0x80;
        let tampered = EncryptedField {
            tag: BASE64.encode(&bytes),
            ..envelope
        };

        assert!(matches!(
            codec.decrypt(&tampered),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_tampered_nonce_rejected() {
        let codec = test_codec();
        let envelope = codec.encrypt(b"payload under test").unwrap();

        let mut bytes = BASE64.decode(&envelope.nonce).unwrap();
        bytes[7] ^= 0xff;
        let tampered = EncryptedField {
            nonce: BASE64.encode(&bytes),
            ..envelope
        };

        assert!(matches!(
            codec.decrypt(&tampered),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let codec = test_codec();
        let other = FieldCodec::new(&[0x43u8; KEY_LEN]).unwrap();
        let envelope = codec.encrypt(b"for the right key only").unwrap();
        assert!(matches!(
            other.decrypt(&envelope),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let err = FieldCodec::new(&[0u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: 16
            }
        ));
    }

    #[test]
    fn test_malformed_envelope_rejected() {
        let codec = test_codec();
        assert!(matches!(
            codec.decrypt_str("not json at all"),
            Err(CryptoError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            codec.decrypt_str(r#"{"nonce":"!!","ciphertext":"","tag":""}"#),
            Err(CryptoError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_sentinel_on_unreadable_field() {
        let codec = test_codec();
        let other = FieldCodec::new(&[0x99u8; KEY_LEN]).unwrap();
        let stored = codec.encrypt_str("secret").unwrap();

        assert_eq!(other.decrypt_or_sentinel(&stored), DECRYPT_FAILED_SENTINEL);
        assert_eq!(codec.decrypt_or_sentinel(&stored), "secret");
    }
}
