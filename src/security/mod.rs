use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::primitives::{Address, H256};

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("No alternate key configured")]
    MissingAlternateKey,
}

/// Signing identity of the local validator. The alternate key signs votes
/// once batched vote verification is active.
pub struct Signer {
    key: SigningKey,
    alternate_key: Option<SigningKey>,
    address: Address,
}

impl Signer {
    pub fn new(key: SigningKey, alternate_key: Option<SigningKey>) -> Self {
        let address = address_from_public_key(&key.verifying_key());
        Self {
            key,
            alternate_key,
            address,
        }
    }

    pub fn generate() -> Self {
        let mut rng = OsRng;
        let key = SigningKey::generate(&mut rng);
        let alternate_key = SigningKey::generate(&mut rng);
        Self::new(key, Some(alternate_key))
    }

    pub fn from_seed_hex(seed: &str, alternate_seed: Option<&str>) -> Result<Self, SignerError> {
        let key = signing_key_from_hex(seed)?;
        let alternate_key = alternate_seed.map(signing_key_from_hex).transpose()?;
        Ok(Self::new(key, alternate_key))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn alternate_public_key(&self) -> Option<VerifyingKey> {
        self.alternate_key.as_ref().map(SigningKey::verifying_key)
    }

    pub fn sign(&self, message: &H256) -> Signature {
        self.key.sign(message.as_bytes())
    }

    pub fn sign_alternate(&self, message: &H256) -> Result<Signature, SignerError> {
        let key = self
            .alternate_key
            .as_ref()
            .ok_or(SignerError::MissingAlternateKey)?;
        Ok(key.sign(message.as_bytes()))
    }
}

fn signing_key_from_hex(seed: &str) -> Result<SigningKey, SignerError> {
    let bytes = hex::decode(seed.trim_start_matches("0x"))
        .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignerError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    Ok(SigningKey::from_bytes(&seed))
}

pub fn public_key_from_hex(key: &str) -> Result<VerifyingKey, SignerError> {
    let bytes = hex::decode(key.trim_start_matches("0x"))
        .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignerError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SignerError::InvalidKey(e.to_string()))
}

/// First 20 bytes of sha256(public key).
pub fn address_from_public_key(key: &VerifyingKey) -> Address {
    let digest = hash_message(key.as_bytes());
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest.0[..20]);
    Address(address)
}

pub fn hash_message(message: &[u8]) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(message);
    H256(hasher.finalize().into())
}

pub fn verify_signature(key: &VerifyingKey, message: &H256, signature: &Signature) -> bool {
    key.verify(message.as_bytes(), signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_hex_round_trip_gives_same_address() {
        let seed = hex::encode([7u8; 32]);
        let a = Signer::from_seed_hex(&seed, None).unwrap();
        let b = Signer::from_seed_hex(&format!("0x{seed}"), None).unwrap();
        assert_eq!(a.address(), b.address());
        assert_eq!(a.address(), address_from_public_key(&a.public_key()));
    }

    #[test]
    fn short_seed_is_rejected() {
        assert!(matches!(
            Signer::from_seed_hex("abcd", None),
            Err(SignerError::InvalidKey(_))
        ));
    }

    #[test]
    fn alternate_signature_requires_alternate_key() {
        let signer = Signer::new(SigningKey::from_bytes(&[1u8; 32]), None);
        let message = hash_message(b"vote");
        assert!(matches!(
            signer.sign_alternate(&message),
            Err(SignerError::MissingAlternateKey)
        ));

        let signature = signer.sign(&message);
        assert!(verify_signature(&signer.public_key(), &message, &signature));
    }
}
