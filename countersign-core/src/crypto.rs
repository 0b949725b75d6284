//! Cryptographic primitives for Countersign.
//!
//! Authorities sign with Ed25519. Every signature is computed over
//! `SIGNATURE_CONTEXT || message` so a credential produced for Countersign
//! cannot be replayed against another protocol that shares the same key.

use crate::error::{Error, Result};
use crate::SIGNATURE_CONTEXT;
use base64::Engine;
use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey as Ed25519SigningKey, VerifyingKey,
};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use secrecy::{CloneableSecret, ExposeSecret, Secret, Zeroize};
use serde::{Deserialize, Serialize};

/// An authority's signing key.
///
/// The Ed25519 key is wrapped in `Secret` so it is zeroized on drop and never
/// shows up in `Debug` output.
#[derive(Clone)]
pub struct SigningKey {
    signing_key: Secret<KeyMaterial>,
}

// ed25519-dalek zeroizes SigningKey on drop; the wrapper only satisfies secrecy's bounds.
struct KeyMaterial(Ed25519SigningKey);

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Zeroize for KeyMaterial {
    fn zeroize(&mut self) {}
}

impl CloneableSecret for KeyMaterial {}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        Self::wrap(Ed25519SigningKey::generate(&mut OsRng))
    }

    /// Create a signing key from secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::wrap(Ed25519SigningKey::from_bytes(bytes))
    }

    /// Create a signing key from a 64-char hex secret.
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::CryptoError("secret key must be 32 bytes".into()))?;
        Ok(Self::from_bytes(&arr))
    }

    fn wrap(key: Ed25519SigningKey) -> Self {
        Self {
            signing_key: Secret::new(KeyMaterial(key)),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.expose_secret().0.verifying_key(),
        }
    }

    /// Sign a message. The signed bytes are `SIGNATURE_CONTEXT || message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let prefixed = prefix_message(message);
        Signature {
            inner: self.signing_key.expose_secret().0.sign(&prefixed),
        }
    }

    /// Get the secret key bytes.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.expose_secret().0.to_bytes()
    }

    /// Create a signing key from a PKCS#8 PEM string.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = Ed25519SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::CryptoError(format!("invalid PEM: {}", e)))?;
        Ok(Self::wrap(key))
    }

    /// Encode the signing key as a PKCS#8 PEM string.
    pub fn to_pem(&self) -> Result<String> {
        self.signing_key
            .expose_secret()
            .0
            .to_pkcs8_pem(LineEnding::LF)
            .map(|s| s.to_string())
            .map_err(|e| Error::CryptoError(format!("PEM encoding failed: {}", e)))
    }
}

fn prefix_message(message: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(SIGNATURE_CONTEXT.len() + message.len());
    prefixed.extend_from_slice(SIGNATURE_CONTEXT);
    prefixed.extend_from_slice(message);
    prefixed
}

/// A registered authority's verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    /// Create a public key from bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key =
            VerifyingKey::from_bytes(bytes).map_err(|e| Error::CryptoError(e.to_string()))?;
        Ok(Self { verifying_key })
    }

    /// Parse a 64-char hex public key (the format used in configuration files).
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::CryptoError("public key must be 32 bytes".into()))?;
        Self::from_bytes(&arr)
    }

    /// Get the public key as bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Hex encoding of the full key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Short fingerprint of the key (first 16 hex chars) for audit metadata.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.to_bytes()[..8])
    }

    /// Verify a signature against a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let prefixed = prefix_message(message);
        self.verifying_key
            .verify_strict(&prefixed, &signature.inner)
            .map_err(|e| Error::InvalidCredential(e.to_string()))
    }

    /// Create a public key from a PEM string.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let verifying_key = VerifyingKey::from_public_key_pem(pem)
            .map_err(|e| Error::CryptoError(format!("invalid PEM: {}", e)))?;
        Ok(Self { verifying_key })
    }

    /// Encode the public key as an SPKI PEM string.
    pub fn to_pem(&self) -> Result<String> {
        self.verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::CryptoError(format!("PEM encoding failed: {}", e)))
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: DalekSignature,
}

impl Signature {
    /// Create a signature from bytes.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self {
            inner: DalekSignature::from_bytes(bytes),
        }
    }

    /// Get the signature as bytes.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }

    /// URL-safe base64 encoding (no padding), the wire format for proofs.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    /// Parse a URL-safe base64 signature.
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|e| Error::InvalidCredential(format!("signature is not base64: {}", e)))?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| Error::InvalidCredential("signature must be 64 bytes".into()))?;
        Ok(Self::from_bytes(&arr))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Signature::from_base64(&s).map_err(serde::de::Error::custom)
    }
}
