//! Credential proofs and their verification.
//!
//! A [`CredentialProof`] is what an authority hands over when it signs or
//! rejects a request. It is bound to one request, one subject, one authority
//! and one action through a SHA-256 digest, so a proof captured for one
//! request cannot be replayed on another.
//!
//! Verification is a pluggable capability ([`CredentialVerifier`]). The default
//! [`Ed25519Verifier`] checks the proof against the key material held in the
//! [`AuthorityRegistry`](crate::authority::AuthorityRegistry); a deployment
//! backed by hardware attestation can substitute its own implementation.

use crate::authority::Authority;
use crate::crypto::{PublicKey, Signature, SigningKey};
use crate::error::{Error, Result};
use crate::request::{AuthorityId, RequestId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Proofs dated further in the future than this are rejected.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Credential class carried by a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialClass {
    /// Verified against the authority's standard key.
    Standard,
    /// Verified against the authority's override key; only honoured while an
    /// emergency is active.
    EmergencyOverride,
}

impl CredentialClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::EmergencyOverride => "emergency_override",
        }
    }
}

/// Action a proof authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialAction {
    Sign,
    Reject,
}

impl CredentialAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sign => "sign",
            Self::Reject => "reject",
        }
    }
}

/// What a proof claims to cover.
#[derive(Debug, Clone, Copy)]
pub struct SigningClaim<'a> {
    pub action: CredentialAction,
    pub request_id: &'a RequestId,
    pub subject_ref: &'a str,
    pub authority_id: &'a AuthorityId,
}

impl SigningClaim<'_> {
    /// Digest signed by the authority:
    /// `H(action | request_id | subject_ref | authority_id | class | signed_at)`.
    pub fn digest(&self, class: CredentialClass, signed_at: DateTime<Utc>) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for part in [
            self.action.as_str(),
            self.request_id.as_str(),
            self.subject_ref,
            self.authority_id.as_str(),
            class.as_str(),
        ] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(signed_at.timestamp_millis().to_le_bytes());
        hasher.finalize().into()
    }
}

/// Opaque signature/attestation material presented by an authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialProof {
    pub class: CredentialClass,
    pub signature: Signature,
    pub signed_at: DateTime<Utc>,
}

impl CredentialProof {
    /// Produce a proof for `claim` with `key`.
    pub fn create(
        key: &SigningKey,
        class: CredentialClass,
        claim: &SigningClaim<'_>,
        signed_at: DateTime<Utc>,
    ) -> Self {
        // Millisecond precision is what the digest covers.
        let signed_at = DateTime::from_timestamp_millis(signed_at.timestamp_millis())
            .unwrap_or(signed_at);
        let digest = claim.digest(class, signed_at);
        Self {
            class,
            signature: key.sign(&digest),
            signed_at,
        }
    }

    /// Standard signature on a request.
    pub fn sign(
        key: &SigningKey,
        request_id: &RequestId,
        subject_ref: &str,
        authority_id: &AuthorityId,
    ) -> Self {
        Self::create(
            key,
            CredentialClass::Standard,
            &SigningClaim {
                action: CredentialAction::Sign,
                request_id,
                subject_ref,
                authority_id,
            },
            Utc::now(),
        )
    }

    /// Rejection of a request.
    pub fn reject(
        key: &SigningKey,
        request_id: &RequestId,
        subject_ref: &str,
        authority_id: &AuthorityId,
    ) -> Self {
        Self::create(
            key,
            CredentialClass::Standard,
            &SigningClaim {
                action: CredentialAction::Reject,
                request_id,
                subject_ref,
                authority_id,
            },
            Utc::now(),
        )
    }

    /// Emergency override signature, made with the authority's override key.
    pub fn emergency_override(
        override_key: &SigningKey,
        request_id: &RequestId,
        subject_ref: &str,
        authority_id: &AuthorityId,
    ) -> Self {
        Self::create(
            override_key,
            CredentialClass::EmergencyOverride,
            &SigningClaim {
                action: CredentialAction::Sign,
                request_id,
                subject_ref,
                authority_id,
            },
            Utc::now(),
        )
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    pub authority_id: AuthorityId,
    pub class: CredentialClass,
    /// Fingerprint of the key that verified the proof.
    pub key_fingerprint: String,
}

/// Verifies credential proofs against an authority's registered material.
pub trait CredentialVerifier: Send + Sync + std::fmt::Debug {
    fn verify(
        &self,
        authority: &Authority,
        claim: &SigningClaim<'_>,
        proof: &CredentialProof,
        now: DateTime<Utc>,
    ) -> Result<VerifiedCredential>;
}

/// Ed25519 verification against registry keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    fn key_for<'a>(authority: &'a Authority, class: CredentialClass) -> Result<&'a PublicKey> {
        match class {
            CredentialClass::Standard => Ok(&authority.public_key),
            CredentialClass::EmergencyOverride => authority.override_key.as_ref().ok_or_else(|| {
                Error::InvalidCredential(format!(
                    "authority '{}' holds no override credential",
                    authority.id
                ))
            }),
        }
    }
}

impl CredentialVerifier for Ed25519Verifier {
    fn verify(
        &self,
        authority: &Authority,
        claim: &SigningClaim<'_>,
        proof: &CredentialProof,
        now: DateTime<Utc>,
    ) -> Result<VerifiedCredential> {
        if claim.authority_id != &authority.id {
            return Err(Error::InvalidCredential(format!(
                "proof names '{}' but was presented for '{}'",
                claim.authority_id, authority.id
            )));
        }
        if proof.signed_at > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(Error::InvalidCredential(
                "proof is dated in the future (check signer clock)".into(),
            ));
        }

        let key = Self::key_for(authority, proof.class)?;
        let digest = claim.digest(proof.class, proof.signed_at);
        key.verify(&digest, &proof.signature)?;

        Ok(VerifiedCredential {
            authority_id: authority.id.clone(),
            class: proof.class,
            key_fingerprint: key.fingerprint(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SigningKey, SigningKey, Authority, RequestId) {
        let key = SigningKey::generate();
        let override_key = SigningKey::generate();
        let authority = Authority::new("director", key.public_key())
            .with_override_key(override_key.public_key());
        (key, override_key, authority, RequestId::generate())
    }

    fn claim<'a>(
        action: CredentialAction,
        request_id: &'a RequestId,
        authority: &'a AuthorityId,
    ) -> SigningClaim<'a> {
        SigningClaim {
            action,
            request_id,
            subject_ref: "incident-42/action-3",
            authority_id: authority,
        }
    }

    #[test]
    fn test_standard_proof_verifies() {
        let (key, _, authority, request_id) = setup();
        let proof = CredentialProof::sign(&key, &request_id, "incident-42/action-3", &authority.id);
        let verified = Ed25519Verifier
            .verify(
                &authority,
                &claim(CredentialAction::Sign, &request_id, &authority.id),
                &proof,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(verified.class, CredentialClass::Standard);
        assert_eq!(verified.key_fingerprint, key.public_key().fingerprint());
    }

    #[test]
    fn test_proof_bound_to_request() {
        let (key, _, authority, request_id) = setup();
        let other = RequestId::generate();
        let proof = CredentialProof::sign(&key, &request_id, "incident-42/action-3", &authority.id);
        let result = Ed25519Verifier.verify(
            &authority,
            &claim(CredentialAction::Sign, &other, &authority.id),
            &proof,
            Utc::now(),
        );
        assert!(matches!(result, Err(Error::InvalidCredential(_))));
    }

    #[test]
    fn test_proof_bound_to_action() {
        let (key, _, authority, request_id) = setup();
        let proof = CredentialProof::sign(&key, &request_id, "incident-42/action-3", &authority.id);
        let result = Ed25519Verifier.verify(
            &authority,
            &claim(CredentialAction::Reject, &request_id, &authority.id),
            &proof,
            Utc::now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_override_requires_override_key() {
        let (key, override_key, authority, request_id) = setup();
        let good = CredentialProof::emergency_override(
            &override_key,
            &request_id,
            "incident-42/action-3",
            &authority.id,
        );
        let c = claim(CredentialAction::Sign, &request_id, &authority.id);
        assert!(Ed25519Verifier.verify(&authority, &c, &good, Utc::now()).is_ok());

        // Standard key cannot mint an override proof.
        let forged = CredentialProof::emergency_override(
            &key,
            &request_id,
            "incident-42/action-3",
            &authority.id,
        );
        assert!(Ed25519Verifier.verify(&authority, &c, &forged, Utc::now()).is_err());

        let plain = Authority::new("duty", key.public_key());
        let c = claim(CredentialAction::Sign, &request_id, &plain.id);
        let proof = CredentialProof::emergency_override(
            &key,
            &request_id,
            "incident-42/action-3",
            &plain.id,
        );
        assert!(matches!(
            Ed25519Verifier.verify(&plain, &c, &proof, Utc::now()),
            Err(Error::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_future_dated_proof_rejected() {
        let (key, _, authority, request_id) = setup();
        let c = claim(CredentialAction::Sign, &request_id, &authority.id);
        let proof = CredentialProof::create(
            &key,
            CredentialClass::Standard,
            &c,
            Utc::now() + Duration::hours(1),
        );
        assert!(Ed25519Verifier.verify(&authority, &c, &proof, Utc::now()).is_err());
    }

    #[test]
    fn test_proof_survives_json() {
        let (key, _, authority, request_id) = setup();
        let proof = CredentialProof::sign(&key, &request_id, "incident-42/action-3", &authority.id);
        let json = serde_json::to_string(&proof).unwrap();
        let back: CredentialProof = serde_json::from_str(&json).unwrap();
        let c = claim(CredentialAction::Sign, &request_id, &authority.id);
        assert!(Ed25519Verifier.verify(&authority, &c, &back, Utc::now()).is_ok());
    }
}
