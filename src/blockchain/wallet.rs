//! Custody keypair generation and signer construction.
//!
//! # Security
//! - Keys are generated in-process and handed straight to the vault
//! - Keys are never logged or serialized
//! - Signers live only for the duration of a single payout

use alloy::primitives::{Address, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;

use crate::blockchain::types::{BlockchainError, BlockchainResult};
use crate::custody::keys::PrivateKey;
use crate::custody::CustodyError;

/// Generate a fresh secp256k1 keypair.
///
/// The key bytes are re-parsed once to make sure the returned address
/// really belongs to the returned key.
pub fn generate_keypair() -> Result<(Address, PrivateKey), CustodyError> {
    let signer = PrivateKeySigner::random();
    let address = signer.address();
    let key = PrivateKey::from_bytes(signer.to_bytes().0);

    let check = signer_from_key(&key).map_err(|e| CustodyError::KeyGeneration(e.to_string()))?;
    if check.address() != address {
        return Err(CustodyError::KeyGeneration(
            "derived address does not match generated key".to_string(),
        ));
    }

    Ok((address, key))
}

/// Build a signer from a decrypted custody key.
pub fn signer_from_key(key: &PrivateKey) -> BlockchainResult<PrivateKeySigner> {
    PrivateKeySigner::from_bytes(&B256::from(*key.as_bytes()))
        .map_err(|e| BlockchainError::Wallet(format!("Invalid private key: {}", e)))
}

/// Parse a hex address supplied by a caller (buyer, seller).
pub fn parse_address(value: &str) -> BlockchainResult<Address> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|e| BlockchainError::InvalidAddress(format!("'{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known test private key (Anvil's first account)
    const TEST_PRIVATE_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn test_key() -> PrivateKey {
        let bytes: B256 = TEST_PRIVATE_KEY.parse().unwrap();
        PrivateKey::from_bytes(bytes.0)
    }

    #[test]
    fn test_signer_from_known_key() {
        let signer = signer_from_key(&test_key()).unwrap();
        assert_eq!(
            signer.address().to_string().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn test_generated_keys_are_distinct() {
        let (a, _) = generate_keypair().unwrap();
        let (b, _) = generate_keypair().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, Address::ZERO);
    }

    #[test]
    fn test_zero_key_rejected() {
        let result = signer_from_key(&PrivateKey::from_bytes([0u8; 32]));
        assert!(matches!(result, Err(BlockchainError::Wallet(_))));
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").is_ok());
        assert!(parse_address("not-an-address").is_err());
    }
}
