//! Field-level encryption for sensitive columns.
//!
//! Terms documents and proof/dispute descriptions are encrypted before
//! they reach SQLite and decrypted on read. The database file itself is
//! not encrypted; this layer is what keeps a leaked dump unreadable.

pub mod field_codec;

pub use field_codec::{CryptoError, EncryptedField, FieldCodec, DECRYPT_FAILED_SENTINEL};

use sha2::{Digest, Sha256};

/// Hex SHA-256 digest, used for log chaining and for storing IP and
/// device fingerprints without the raw values.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
