//! Account identity
//!
//! An account is an Ed25519 seed. Its public key, optionally prefixed with an
//! identifier, is the account's address on the overlay network.

use std::fmt;

use ed25519_dalek::SigningKey;
use rand::RngCore;

use crate::{Result, TunnelError};

/// Seed length in bytes
pub const SEED_LEN: usize = 32;

/// Overlay account backed by an Ed25519 seed
#[derive(Clone)]
pub struct Account {
    signing_key: SigningKey,
}

impl Account {
    /// Build from a seed. An empty seed generates a fresh random one.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        if seed.is_empty() {
            return Ok(Self::generate());
        }
        let seed: [u8; SEED_LEN] = seed.try_into().map_err(|_| {
            TunnelError::InvalidSeed(format!("expected {} bytes, got {}", SEED_LEN, seed.len()))
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Build from a hex seed; empty string generates a random account.
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let seed = hex::decode(seed_hex.trim())
            .map_err(|e| TunnelError::InvalidSeed(e.to_string()))?;
        Self::from_seed(&seed)
    }

    /// Random account
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_LEN];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Seed as hex, for operators to persist a generated identity
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Overlay address for the given identifier (`identifier.pubkey`)
    pub fn address(&self, identifier: &str) -> String {
        if identifier.is_empty() {
            self.public_key_hex()
        } else {
            format!("{}.{}", identifier, self.public_key_hex())
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED_HEX: &str = "e68e046d13dd911594576ba0f4a196e9666790dc492071ad9ea5972c0b940435";

    #[test]
    fn test_seed_roundtrip() {
        let account = Account::from_seed_hex(SEED_HEX).unwrap();
        assert_eq!(account.seed_hex(), SEED_HEX);
    }

    #[test]
    fn test_same_seed_same_address() {
        let a = Account::from_seed_hex(SEED_HEX).unwrap();
        let b = Account::from_seed_hex(SEED_HEX).unwrap();
        assert_eq!(a.address("bob"), b.address("bob"));
    }

    #[test]
    fn test_address_format() {
        let account = Account::generate();
        let pk = account.public_key_hex();
        assert_eq!(pk.len(), 64);
        assert_eq!(account.address(""), pk);
        assert_eq!(account.address("alice"), format!("alice.{}", pk));
    }

    #[test]
    fn test_empty_seed_generates() {
        let a = Account::from_seed(&[]).unwrap();
        let b = Account::from_seed(&[]).unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_invalid_seed_length() {
        let err = Account::from_seed(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidSeed(_)));
    }

    #[test]
    fn test_invalid_seed_hex() {
        assert!(Account::from_seed_hex("zz").is_err());
    }

    #[test]
    fn test_debug_hides_seed() {
        let account = Account::from_seed_hex(SEED_HEX).unwrap();
        assert!(!format!("{:?}", account).contains(SEED_HEX));
    }
}
