use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::primitives::H256;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
}

/// Opaque transaction. Execution semantics belong to the backend; consensus
/// only needs a stable identity and a byte payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub nonce: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    pub sender: String,
    pub nonce: u64,
    pub data: String,
}

impl Transaction {
    pub fn new(sender: String, nonce: u64, data: Vec<u8>) -> Self {
        Self { sender, nonce, data }
    }

    pub fn hash(&self) -> H256 {
        let mut bytes = Vec::with_capacity(self.sender.len() + 8 + self.data.len());
        bytes.extend_from_slice(self.sender.as_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes.extend_from_slice(&self.data);
        H256::digest(&bytes)
    }

    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.sender.is_empty() {
            return Err(TransactionError::ValidationError("Sender is empty".to_string()));
        }
        Ok(())
    }
}

impl TryFrom<CreateTransactionRequest> for Transaction {
    type Error = TransactionError;

    fn try_from(request: CreateTransactionRequest) -> Result<Self, Self::Error> {
        let data = hex::decode(request.data.trim_start_matches("0x"))
            .map_err(|e| TransactionError::ValidationError(e.to_string()))?;
        let tx = Transaction::new(request.sender, request.nonce, data);
        tx.validate()?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_depends_on_nonce() {
        let a = Transaction::new("alice".to_string(), 1, vec![1, 2]);
        let b = Transaction::new("alice".to_string(), 2, vec![1, 2]);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.clone().hash());
    }

    #[test]
    fn request_with_bad_hex_is_rejected() {
        let request = CreateTransactionRequest {
            sender: "alice".to_string(),
            nonce: 0,
            data: "0xzz".to_string(),
        };
        assert!(Transaction::try_from(request).is_err());
    }
}
