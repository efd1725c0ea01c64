//! Payload decryption seam.
//!
//! Push payloads arrive encrypted per RFC 8291-style web push encryption.
//! The cipher itself lives behind [`PayloadDecryptor`] so deployments choose
//! their own primitive stack; this module only handles the protocol-defined
//! parameter plumbing: each data message carries the sender's ephemeral
//! Diffie-Hellman share and the salt as app-data attributes, base64url
//! encoded with the padding stripped.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use thiserror::Error;

use crate::credentials::Credentials;
use crate::wire::DataMessageStanza;

/// App-data key carrying the sender's ephemeral public key.
pub const CRYPTO_KEY_ATTR: &str = "crypto-key";

/// App-data key carrying the encryption salt.
pub const ENCRYPTION_ATTR: &str = "encryption";

const DH_PREFIX: &str = "dh=";
const SALT_PREFIX: &str = "salt=";

/// Decryption failure detail.
#[derive(Error, Debug)]
pub enum DecryptError {
    /// A required app-data attribute was absent.
    #[error("Missing encryption parameter `{0}`")]
    MissingParameter(&'static str),

    /// An attribute was present but not in the expected form.
    #[error("Malformed encryption parameter `{name}`: {reason}")]
    MalformedParameter {
        /// Attribute that failed to parse.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The configured key material could not be used.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// The ciphertext failed authentication or padding checks.
    #[error("Ciphertext rejected: {0}")]
    Ciphertext(String),
}

/// Decrypts push payloads.
///
/// Implementations receive the device credentials (which hold the receiver
/// key pair and auth secret), the per-message salt and sender share, and the
/// raw ciphertext. The session treats any error as a recoverable read
/// failure: the message is skipped and left unacknowledged.
pub trait PayloadDecryptor: Send + Sync {
    /// Decrypt one payload.
    fn decrypt(
        &self,
        credentials: &Credentials,
        salt: &[u8],
        sender_public_key: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptError>;
}

/// Per-message encryption parameters lifted out of a data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionParams {
    /// Per-message salt from the `encryption` attribute.
    pub salt: Vec<u8>,
    /// Sender's ephemeral public key from the `crypto-key` attribute.
    pub sender_public_key: Vec<u8>,
}

impl EncryptionParams {
    /// Extract salt and sender share from the message's app data.
    pub fn from_message(message: &DataMessageStanza) -> Result<Self, DecryptError> {
        let crypto_key = message
            .app_data_value(CRYPTO_KEY_ATTR)
            .ok_or(DecryptError::MissingParameter(CRYPTO_KEY_ATTR))?;
        let encryption = message
            .app_data_value(ENCRYPTION_ATTR)
            .ok_or(DecryptError::MissingParameter(ENCRYPTION_ATTR))?;

        Ok(Self {
            sender_public_key: decode_prefixed(crypto_key, DH_PREFIX, CRYPTO_KEY_ATTR)?,
            salt: decode_prefixed(encryption, SALT_PREFIX, ENCRYPTION_ATTR)?,
        })
    }
}

fn decode_prefixed(
    value: &str,
    prefix: &str,
    name: &'static str,
) -> Result<Vec<u8>, DecryptError> {
    let encoded = value
        .strip_prefix(prefix)
        .ok_or_else(|| DecryptError::MalformedParameter {
            name,
            reason: format!("expected `{prefix}` prefix"),
        })?;
    decode_base64url_padded(encoded).map_err(|e| DecryptError::MalformedParameter {
        name,
        reason: e.to_string(),
    })
}

/// Decode base64url input whose padding may have been stripped in transit.
pub fn decode_base64url_padded(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let mut padded = input.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    URL_SAFE.decode(padded.as_bytes())
}
