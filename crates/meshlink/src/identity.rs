//! Peer identity
//!
//! A peer id is the base-62 big-integer encoding of the peer's ed25519 public
//! key. The encoding is injective and decodes back to the exact key bytes, so
//! a signature can be checked against the key recovered from the id alone.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use tracing::info;

use crate::storage::{SecureStorage, StorageError, IDENTITY_KEY};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid base62 character {0:?}")]
    InvalidCharacter(char),
    #[error("Peer id decodes to {0} bytes, expected 32")]
    InvalidKeyLength(usize),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Base-62 big-integer encoding with leading zero bytes kept as leading '0's
pub mod base62 {
    use super::IdentityError;

    const ALPHABET: &[u8; 62] =
        b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

    pub fn encode(bytes: &[u8]) -> String {
        let zeros = bytes.iter().take_while(|b| **b == 0).count();

        // little-endian base-62 digits
        let mut digits: Vec<u8> = Vec::with_capacity(bytes.len() * 138 / 100 + 1);
        for &byte in &bytes[zeros..] {
            let mut carry = byte as u32;
            for digit in digits.iter_mut() {
                carry += (*digit as u32) << 8;
                *digit = (carry % 62) as u8;
                carry /= 62;
            }
            while carry > 0 {
                digits.push((carry % 62) as u8);
                carry /= 62;
            }
        }

        let mut out = String::with_capacity(zeros + digits.len());
        out.extend(std::iter::repeat('0').take(zeros));
        out.extend(digits.iter().rev().map(|d| ALPHABET[*d as usize] as char));
        out
    }

    pub fn decode(text: &str) -> Result<Vec<u8>, IdentityError> {
        let zeros = text.bytes().take_while(|c| *c == b'0').count();

        // little-endian base-256 digits
        let mut bytes: Vec<u8> = Vec::with_capacity(text.len());
        for c in text.chars().skip(zeros) {
            let mut carry = digit_value(c)? as u32;
            for byte in bytes.iter_mut() {
                carry += (*byte as u32) * 62;
                *byte = (carry & 0xff) as u8;
                carry >>= 8;
            }
            while carry > 0 {
                bytes.push((carry & 0xff) as u8);
                carry >>= 8;
            }
        }

        let mut out = vec![0u8; zeros];
        out.extend(bytes.iter().rev());
        Ok(out)
    }

    fn digit_value(c: char) -> Result<u8, IdentityError> {
        match c {
            '0'..='9' => Ok(c as u8 - b'0'),
            'A'..='Z' => Ok(c as u8 - b'A' + 10),
            'a'..='z' => Ok(c as u8 - b'a' + 36),
            _ => Err(IdentityError::InvalidCharacter(c)),
        }
    }
}

/// Encode a public key as a peer id
pub fn peer_id_from_public_key(public_key: &[u8]) -> String {
    base62::encode(public_key)
}

/// Recover the public key bytes from a peer id
pub fn public_key_from_peer_id(peer_id: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = base62::decode(peer_id)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::InvalidKeyLength(bytes.len()))
}

/// Check `signature` over `message` against the key encoded in `peer_id`.
///
/// Any decoding failure counts as a failed verification.
pub fn verify(peer_id: &str, message: &[u8], signature: &[u8]) -> bool {
    let Ok(public_key) = public_key_from_peer_id(peer_id) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify_strict(message, &signature).is_ok()
}

/// The lexicographically smaller peer id is the polite one
pub fn is_polite(local_peer_id: &str, target_peer_id: &str) -> bool {
    local_peer_id < target_peer_id
}

/// Local keypair
pub struct Identity {
    signing_key: SigningKey,
    peer_id: String,
}

impl Identity {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_secret_bytes(&secret)
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let peer_id = peer_id_from_public_key(signing_key.verifying_key().as_bytes());
        Self {
            signing_key,
            peer_id,
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, IdentityError> {
        let bytes =
            hex::decode(secret_hex).map_err(|e| IdentityError::InvalidSecretKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidSecretKey(format!("{} bytes", bytes.len())))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    /// Load the stored keypair, generating and storing one on first use
    pub async fn load_or_generate(storage: &dyn SecureStorage) -> Result<Self, IdentityError> {
        if let Some(secret_hex) = storage.retrieve(IDENTITY_KEY).await? {
            return Self::from_secret_hex(&secret_hex);
        }

        let identity = Self::generate();
        storage
            .store(IDENTITY_KEY, &identity.secret_hex())
            .await?;
        info!("Generated new identity {}", identity.peer_id);
        Ok(identity)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
