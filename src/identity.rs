//! Node credential
//!
//! A secp256k1 key; the node's identity is the derived address. Messages are
//! signed EIP-191 style so any peer can recover and check the signer.

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Signature;
use ethers::utils::hash_message;

use crate::types::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("environment variable {0} is not set")]
    MissingKey(String),
    #[error("invalid node key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Signing identity of this node
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    wallet: LocalWallet,
}

impl NodeIdentity {
    /// Parse a hex private key (with or without 0x prefix)
    pub fn from_hex(key: &str) -> Result<Self, IdentityError> {
        let trimmed = key.trim();
        let normalized = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        if normalized.len() != 64 {
            return Err(IdentityError::InvalidKey(format!(
                "expected 64 hex chars, got {}",
                normalized.len()
            )));
        }
        let wallet: LocalWallet = normalized
            .parse()
            .map_err(|e| IdentityError::InvalidKey(format!("{}", e)))?;
        Ok(Self { wallet })
    }

    /// Load the key from the named environment variable
    pub fn from_env(var: &str) -> Result<Self, IdentityError> {
        let key = std::env::var(var).map_err(|_| IdentityError::MissingKey(var.to_string()))?;
        Self::from_hex(&key)
    }

    /// Fresh random identity (tests and local simulations)
    pub fn random() -> Self {
        Self {
            wallet: LocalWallet::new(&mut rand::thread_rng()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.wallet.address()
    }

    /// EIP-191 signature over `message`
    pub fn sign(&self, message: &[u8]) -> Result<Signature, IdentityError> {
        self.wallet
            .sign_hash(hash_message(message))
            .map_err(|e| IdentityError::Signing(e.to_string()))
    }
}

/// Check that `signature` over `message` recovers to `signer`
pub fn verify_signature(message: &[u8], signature: &Signature, signer: NodeId) -> bool {
    signature.verify(message, signer).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn parses_key_with_and_without_prefix() {
        let a = NodeIdentity::from_hex(KEY).unwrap();
        let b = NodeIdentity::from_hex(KEY.trim_start_matches("0x")).unwrap();
        assert_eq!(a.node_id(), b.node_id());
    }

    #[test]
    fn rejects_short_key() {
        assert!(matches!(
            NodeIdentity::from_hex("0x1234"),
            Err(IdentityError::InvalidKey(_))
        ));
    }

    #[test]
    fn missing_env_key_is_reported() {
        let err = NodeIdentity::from_env("ORACLE_NODE_KEY_DEFINITELY_UNSET").unwrap_err();
        assert!(matches!(err, IdentityError::MissingKey(_)));
    }

    #[test]
    fn signatures_verify_only_for_signer() {
        let identity = NodeIdentity::random();
        let other = NodeIdentity::random();
        let sig = identity.sign(b"round-42").unwrap();

        assert!(verify_signature(b"round-42", &sig, identity.node_id()));
        assert!(!verify_signature(b"round-43", &sig, identity.node_id()));
        assert!(!verify_signature(b"round-42", &sig, other.node_id()));
    }
}
