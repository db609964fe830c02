//! Key custody subsystem.
//!
//! # Data Flow
//! ```text
//! escrow create:
//!     vault.rs generate keypair → encrypt immediately → drop plaintext
//!     → (address, EncryptedKey) persisted on the escrow
//!
//! payout:
//!     dispatcher → vault.rs decrypt → blockchain::wallet signer
//!     → broadcast → plaintext dropped (zeroized)
//! ```
//!
//! # Security Constraints
//! - Plaintext keys never reach logs, audit records or API responses
//! - `PrivateKey`/`MasterSecret` have redacting Debug and no Serialize
//! - Master secret comes only from the environment, loaded once

pub mod keys;
pub mod vault;

pub use keys::{EncryptedKey, MasterSecret, PrivateKey, MIN_SECRET_LEN};
pub use vault::{decrypt, encrypt, CustodyWallet, KeyVault};

use thiserror::Error;

/// Errors raised by key custody operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CustodyError {
    /// Master secret absent/malformed, or the cipher refused to encrypt.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Tampered ciphertext, wrong secret or unreadable blob.
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Keypair generation failed.
    #[error("Key generation error: {0}")]
    KeyGeneration(String),
}
