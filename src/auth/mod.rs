//! Credential obfuscation for persisted configuration
//!
//! Database passwords are held in plain text in memory and written to
//! configuration files as Base64 ciphertext marked `encrypted="true"`.
//!
//! ## Security
//!
//! The key is compiled into the crate and identical for every installation, so
//! anyone with this crate can recover the password. This only keeps passwords from
//! being readable at a glance in configuration files. Changing the key breaks every
//! configuration file written so far.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

/// Fixed key shared by all installations
const CREDENTIAL_KEY: &[u8] = b"genomic-data-sdk/credentials/v1";

/// Error type for credential decoding
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential is not valid Base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("Decrypted credential is not valid UTF-8")]
    Utf8,
}

/// Keystream block `counter`: SHA-256 of key and block counter
fn keystream_block(counter: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(CREDENTIAL_KEY);
    hasher.update(counter.to_be_bytes());
    let digest = hasher.finalize();
    let mut block = [0u8; 32];
    block.copy_from_slice(&digest);
    block
}

fn apply_keystream(data: &mut [u8]) {
    for (index, chunk) in data.chunks_mut(32).enumerate() {
        let block = keystream_block(index as u64);
        for (byte, key) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= key;
        }
    }
}

/// Encrypt a credential for persistence
///
/// # Example
///
/// ```rust
/// use genomic_data_sdk::auth::{decrypt_credential, encrypt_credential};
///
/// let stored = encrypt_credential("s3cret");
/// assert_ne!(stored, "s3cret");
/// assert_eq!(decrypt_credential(&stored).unwrap(), "s3cret");
/// ```
pub fn encrypt_credential(plain: &str) -> String {
    let mut bytes = plain.as_bytes().to_vec();
    apply_keystream(&mut bytes);
    STANDARD.encode(bytes)
}

/// Decrypt a credential read from persisted configuration
pub fn decrypt_credential(encoded: &str) -> Result<String, CredentialError> {
    let mut bytes = STANDARD.decode(encoded.trim())?;
    apply_keystream(&mut bytes);
    String::from_utf8(bytes).map_err(|_| CredentialError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_is_deterministic() {
        assert_eq!(encrypt_credential("genome"), encrypt_credential("genome"));
        assert_eq!(encrypt_credential(""), "");
    }

    #[test]
    fn test_long_credentials_span_blocks() {
        let long = "p".repeat(100);
        let stored = encrypt_credential(&long);
        assert_eq!(decrypt_credential(&stored).unwrap(), long);
    }

    #[test]
    fn test_unicode_credentials() {
        let stored = encrypt_credential("pässwörd");
        assert_eq!(decrypt_credential(&stored).unwrap(), "pässwörd");
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        assert!(matches!(
            decrypt_credential("not base64!"),
            Err(CredentialError::Encoding(_))
        ));
    }
}
