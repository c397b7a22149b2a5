//! Local ed25519 signer.
//!
//! Stands in for a wallet. The address is derived from the public key, so
//! the same seed always yields the same member.

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey, Verifier, VerifyingKey};

use conclave_core::Address;
use conclave_sync::{Result, Signer, SyncError};

/// A wallet stand-in holding an ed25519 key.
#[derive(Clone)]
pub struct LocalSigner {
    signing_key: SigningKey,
}

impl LocalSigner {
    /// Generate a new random signer.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Check a signature produced by this signer.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&bytes);
        self.verifying_key().verify(message, &signature).is_ok()
    }
}

/// `0x` + the first 20 bytes of BLAKE3(public key), hex encoded.
pub fn address_for(key: &VerifyingKey) -> Address {
    let digest = blake3::hash(key.as_bytes());
    Address::new(format!("0x{}", hex::encode(&digest.as_bytes()[..20])))
}

#[async_trait]
impl Signer for LocalSigner {
    fn address(&self) -> Address {
        address_for(&self.verifying_key())
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        if message.is_empty() {
            return Err(SyncError::Signer("refusing to sign an empty message".into()));
        }
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}
