//! Signature ledger: the distinct authorities that have signed a request.
//!
//! The ledger holds at most one [`SignatureRecord`] per `(request, authority)`
//! pair. Re-signing is accepted and leaves the set untouched, so a signature
//! never counts twice toward a threshold.

use crate::authority::{Authority, AuthorityRegistry};
use crate::credential::{
    CredentialAction, CredentialClass, CredentialProof, CredentialVerifier, SigningClaim,
    VerifiedCredential,
};
use crate::error::{Error, Result};
use crate::request::{AuthorityId, AuthorizationRequest, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One authority's act of signing a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub request_id: RequestId,
    pub authority_id: AuthorityId,
    pub proof: CredentialProof,
    /// Fingerprint of the key that verified `proof`.
    pub key_fingerprint: String,
    /// When the signer produced the proof.
    pub signed_at: DateTime<Utc>,
    /// When the ledger accepted it.
    pub recorded_at: DateTime<Utc>,
}

/// Signatures on a single request, keyed by authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignatureSet {
    records: BTreeMap<AuthorityId, SignatureRecord>,
}

impl SignatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored signatures.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, authority: &AuthorityId) -> bool {
        self.records.contains_key(authority)
    }

    pub fn get(&self, authority: &AuthorityId) -> Option<&SignatureRecord> {
        self.records.get(authority)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignatureRecord> {
        self.records.values()
    }

    /// Distinct authorities named by the records themselves.
    ///
    /// Counted from the record bodies rather than the map keys so a record
    /// filed under the wrong key cannot inflate the count.
    pub fn distinct_signers(&self) -> BTreeSet<&AuthorityId> {
        self.records.values().map(|r| &r.authority_id).collect()
    }

    /// Insert a record, keeping the first one for an authority.
    ///
    /// Returns `false` when the authority had already signed.
    pub fn insert(&mut self, record: SignatureRecord) -> bool {
        if self.records.contains_key(&record.authority_id) {
            return false;
        }
        self.records.insert(record.authority_id.clone(), record);
        true
    }
}

impl FromIterator<SignatureRecord> for SignatureSet {
    fn from_iter<T: IntoIterator<Item = SignatureRecord>>(iter: T) -> Self {
        let mut set = Self::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

/// Result of [`SignatureLedger::record_signature`].
#[derive(Debug, Clone)]
pub struct LedgerOutcome {
    /// Always true on success; kept for the request/response contract.
    pub accepted: bool,
    /// The record added by this call, `None` for an idempotent re-sign.
    pub recorded: Option<SignatureRecord>,
    pub signatures: SignatureSet,
    /// The credential as verified on this call.
    pub verified: VerifiedCredential,
}

impl LedgerOutcome {
    pub fn is_new(&self) -> bool {
        self.recorded.is_some()
    }
}

/// Validates and records signatures against a request.
///
/// The ledger does not persist anything itself; the lifecycle service commits
/// the returned record together with its audit entry.
#[derive(Debug, Clone, Copy)]
pub struct SignatureLedger<'a> {
    registry: &'a AuthorityRegistry,
    verifier: &'a dyn CredentialVerifier,
}

impl<'a> SignatureLedger<'a> {
    pub fn new(registry: &'a AuthorityRegistry, verifier: &'a dyn CredentialVerifier) -> Self {
        Self { registry, verifier }
    }

    /// Record `authority_id`'s signature on `request`.
    ///
    /// # Errors
    ///
    /// - `UnknownRequest` if the request is terminal.
    /// - `UnauthorizedSigner` if the authority is not in `policy.signers`.
    /// - `InvalidCredential` if no active key is registered for it, or the
    ///   proof does not verify.
    pub fn record_signature(
        &self,
        request: &AuthorizationRequest,
        signatures: &SignatureSet,
        authority_id: &AuthorityId,
        proof: &CredentialProof,
        now: DateTime<Utc>,
    ) -> Result<LedgerOutcome> {
        if request.is_terminal() || request.is_expired_at(now) {
            return Err(Error::UnknownRequest(request.id.to_string()));
        }

        if !request.policy.is_eligible(authority_id) {
            return Err(Error::UnauthorizedSigner {
                authority: authority_id.to_string(),
                request_id: request.id.to_string(),
                reason: "not in the eligible signer pool".into(),
            });
        }
        let authority = resolve_key_material(self.registry, authority_id)?;

        let claim = SigningClaim {
            action: CredentialAction::Sign,
            request_id: &request.id,
            subject_ref: &request.subject_ref,
            authority_id,
        };
        let verified = self.verifier.verify(authority, &claim, proof, now)?;

        if signatures.contains(authority_id) {
            debug!(
                request_id = %request.id,
                authority = %authority_id,
                "duplicate signature ignored"
            );
            return Ok(LedgerOutcome {
                accepted: true,
                recorded: None,
                signatures: signatures.clone(),
                verified,
            });
        }

        let record = SignatureRecord {
            request_id: request.id.clone(),
            authority_id: authority_id.clone(),
            proof: proof.clone(),
            key_fingerprint: verified.key_fingerprint.clone(),
            signed_at: proof.signed_at,
            recorded_at: now,
        };
        let mut updated = signatures.clone();
        updated.insert(record.clone());

        debug!(
            request_id = %request.id,
            authority = %authority_id,
            override_class = proof.class == CredentialClass::EmergencyOverride,
            count = updated.len(),
            "signature recorded"
        );
        Ok(LedgerOutcome {
            accepted: true,
            recorded: Some(record),
            signatures: updated,
            verified,
        })
    }
}

/// Key material for an eligible signer. A pool member with no active
/// registration has nothing to verify against.
pub(crate) fn resolve_key_material<'r>(
    registry: &'r AuthorityRegistry,
    authority_id: &AuthorityId,
) -> Result<&'r Authority> {
    registry.resolve(authority_id).map_err(|_| {
        Error::InvalidCredential(format!(
            "no active key material registered for {}",
            authority_id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Ed25519Verifier;
    use crate::crypto::SigningKey;
    use crate::request::{ApprovalPolicy, RequestKind, RequestStatus};
    use chrono::Duration;

    struct Fixture {
        keys: BTreeMap<&'static str, SigningKey>,
        registry: AuthorityRegistry,
        request: AuthorizationRequest,
    }

    fn fixture() -> Fixture {
        let mut keys = BTreeMap::new();
        let mut registry = AuthorityRegistry::new();
        for name in ["alpha", "bravo", "charlie", "outsider"] {
            let key = SigningKey::generate();
            registry.register(Authority::new(name, key.public_key()));
            keys.insert(name, key);
        }
        let now = Utc::now();
        let request = AuthorizationRequest {
            id: RequestId::generate(),
            kind: RequestKind::Packet,
            subject_ref: "incident-7".into(),
            policy: ApprovalPolicy::new(2, ["alpha", "bravo", "charlie"]),
            status: RequestStatus::Pending,
            created_at: now,
            expires_at: now + Duration::hours(1),
            authorized_at: None,
            closed_at: None,
            previous_chain_hash: None,
            rejection: None,
            override_grant: None,
        };
        Fixture {
            keys,
            registry,
            request,
        }
    }

    fn proof(f: &Fixture, who: &'static str) -> CredentialProof {
        CredentialProof::sign(
            &f.keys[who],
            &f.request.id,
            &f.request.subject_ref,
            &AuthorityId::new(who),
        )
    }

    #[test]
    fn test_records_first_signature() {
        let f = fixture();
        let ledger = SignatureLedger::new(&f.registry, &Ed25519Verifier);
        let out = ledger
            .record_signature(
                &f.request,
                &SignatureSet::new(),
                &AuthorityId::new("alpha"),
                &proof(&f, "alpha"),
                Utc::now(),
            )
            .unwrap();
        assert!(out.accepted);
        assert!(out.is_new());
        assert_eq!(out.signatures.len(), 1);
    }

    #[test]
    fn test_resign_is_idempotent() {
        let f = fixture();
        let ledger = SignatureLedger::new(&f.registry, &Ed25519Verifier);
        let alpha = AuthorityId::new("alpha");
        let first = ledger
            .record_signature(
                &f.request,
                &SignatureSet::new(),
                &alpha,
                &proof(&f, "alpha"),
                Utc::now(),
            )
            .unwrap();
        let second = ledger
            .record_signature(
                &f.request,
                &first.signatures,
                &alpha,
                &proof(&f, "alpha"),
                Utc::now(),
            )
            .unwrap();
        assert!(second.accepted);
        assert!(!second.is_new());
        assert_eq!(second.signatures, first.signatures);
    }

    #[test]
    fn test_outsider_is_unauthorized() {
        let f = fixture();
        let ledger = SignatureLedger::new(&f.registry, &Ed25519Verifier);
        let err = ledger
            .record_signature(
                &f.request,
                &SignatureSet::new(),
                &AuthorityId::new("outsider"),
                &proof(&f, "outsider"),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnauthorizedSigner { .. }));
    }

    #[test]
    fn test_wrong_key_is_invalid_credential() {
        let f = fixture();
        let ledger = SignatureLedger::new(&f.registry, &Ed25519Verifier);
        let forged = CredentialProof::sign(
            &f.keys["bravo"],
            &f.request.id,
            &f.request.subject_ref,
            &AuthorityId::new("alpha"),
        );
        let err = ledger
            .record_signature(
                &f.request,
                &SignatureSet::new(),
                &AuthorityId::new("alpha"),
                &forged,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_)));
    }

    #[test]
    fn test_terminal_request_is_unknown() {
        let mut f = fixture();
        f.request.status = RequestStatus::Authorized;
        let ledger = SignatureLedger::new(&f.registry, &Ed25519Verifier);
        let err = ledger
            .record_signature(
                &f.request,
                &SignatureSet::new(),
                &AuthorityId::new("alpha"),
                &proof(&f, "alpha"),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRequest(_)));
    }

    #[test]
    fn test_unregistered_outsider_is_unauthorized() {
        let f = fixture();
        let ledger = SignatureLedger::new(&f.registry, &Ed25519Verifier);
        let stranger = SigningKey::generate();
        let id = AuthorityId::new("stranger");
        let p = CredentialProof::sign(&stranger, &f.request.id, &f.request.subject_ref, &id);
        let err = ledger
            .record_signature(&f.request, &SignatureSet::new(), &id, &p, Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::UnauthorizedSigner { .. }));
    }

    #[test]
    fn test_pool_member_without_key_is_invalid_credential() {
        let mut f = fixture();
        f.request.policy = ApprovalPolicy::new(2, ["alpha", "bravo", "ghost"]);
        let ledger = SignatureLedger::new(&f.registry, &Ed25519Verifier);
        let ghost_key = SigningKey::generate();
        let id = AuthorityId::new("ghost");
        let p = CredentialProof::sign(&ghost_key, &f.request.id, &f.request.subject_ref, &id);
        let err = ledger
            .record_signature(&f.request, &SignatureSet::new(), &id, &p, Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_)));
    }
}
