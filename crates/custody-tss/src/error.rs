//! Error types for custody TSS operations

use thiserror::Error;

/// Result type alias for custody TSS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during key generation or recovery signing
#[derive(Debug, Error)]
pub enum Error {
    /// Round payload state does not match the handler's expected state
    #[error("Invalid round state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Missing or index-mismatched peer share
    #[error("Invalid share: {0}")]
    InvalidShare(String),

    /// Combined/derived public keys disagree across parties
    #[error("Common keychain mismatch: {0}")]
    CommonKeychainMismatch(String),

    /// Wrong passphrase or corrupted ciphertext
    #[error("Decryption failed")]
    Decryption,

    /// Final combination of partial signatures failed its validity check
    #[error("Signature construction failed: {0}")]
    SignatureConstruction(String),

    /// Decrypted key material matches neither known share layout
    #[error("Unrecognized key material: {0}")]
    Classification(String),

    /// A single-use challenge or sign share was consumed twice
    #[error("Share already consumed: {0}")]
    ShareReuse(String),

    /// Balance lookup reported insufficient funds; surfaced unchanged
    #[error("Insufficient funds for {address}: have {balance}, need {required}")]
    InsufficientFunds {
        address: String,
        balance: u128,
        required: u128,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key derivation error
    #[error("Key derivation error: {0}")]
    Derivation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
