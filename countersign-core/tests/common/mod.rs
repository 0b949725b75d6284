//! Shared fixtures for integration tests.
#![allow(dead_code)]

use countersign::{
    credential::SigningClaim, ApprovalPolicy, Authority, AuthorityId, AuthorityRegistry,
    AuthorizationRequest, AuthorizationService, Clock, CredentialAction, CredentialClass,
    CredentialProof, ManualClock, MemoryStore, Result, SigningKey, Store,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Five authorities: `alpha` holds a veto, `echo` also has an override key.
pub const AUTHORITIES: [&str; 5] = ["alpha", "bravo", "charlie", "delta", "echo"];

pub struct Harness {
    pub service: AuthorizationService,
    pub keys: HashMap<&'static str, SigningKey>,
    pub override_keys: HashMap<&'static str, SigningKey>,
    pub clock: Arc<ManualClock>,
}

type Keys = HashMap<&'static str, SigningKey>;

pub fn registry() -> (AuthorityRegistry, Keys, Keys) {
    let mut keys = HashMap::new();
    let mut override_keys = HashMap::new();
    let mut registry = AuthorityRegistry::new();
    for name in AUTHORITIES.into_iter().chain(["outsider"]) {
        let key = SigningKey::generate();
        let mut authority = Authority::new(name, key.public_key());
        if name == "alpha" {
            authority = authority.with_veto();
        }
        if name == "echo" {
            let override_key = SigningKey::generate();
            authority = authority.with_override_key(override_key.public_key());
            override_keys.insert(name, override_key);
        }
        registry.register(authority);
        keys.insert(name, key);
    }
    (registry, keys, override_keys)
}

pub fn harness() -> Harness {
    harness_on(Arc::new(MemoryStore::new()))
}

pub fn harness_on(store: Arc<dyn Store>) -> Harness {
    let (registry, keys, override_keys) = registry();
    let clock = Arc::new(ManualClock::default());
    let service = AuthorizationService::builder(store)
        .registry(registry)
        .clock(clock.clone())
        .build()
        .expect("service builds");
    Harness {
        service,
        keys,
        override_keys,
        clock,
    }
}

/// `threshold` of the five standard authorities.
pub fn policy(threshold: u32) -> ApprovalPolicy {
    ApprovalPolicy::new(threshold, AUTHORITIES)
}

impl Harness {
    pub fn proof(
        &self,
        request: &AuthorizationRequest,
        who: &'static str,
        action: CredentialAction,
    ) -> CredentialProof {
        let id = AuthorityId::new(who);
        CredentialProof::create(
            &self.keys[who],
            CredentialClass::Standard,
            &SigningClaim {
                action,
                request_id: &request.id,
                subject_ref: &request.subject_ref,
                authority_id: &id,
            },
            self.clock.now(),
        )
    }

    pub fn sign(
        &self,
        request: &AuthorizationRequest,
        who: &'static str,
    ) -> Result<AuthorizationRequest> {
        let proof = self.proof(request, who, CredentialAction::Sign);
        self.service
            .submit_signature(&request.id, &AuthorityId::new(who), &proof)
    }

    pub fn reject(
        &self,
        request: &AuthorizationRequest,
        who: &'static str,
    ) -> Result<AuthorizationRequest> {
        let proof = self.proof(request, who, CredentialAction::Reject);
        self.service.reject_request(
            &request.id,
            &AuthorityId::new(who),
            "unsafe switching order",
            &proof,
        )
    }

    pub fn override_proof(
        &self,
        request: &AuthorizationRequest,
        who: &'static str,
    ) -> CredentialProof {
        let id = AuthorityId::new(who);
        CredentialProof::create(
            &self.override_keys[who],
            CredentialClass::EmergencyOverride,
            &SigningClaim {
                action: CredentialAction::Sign,
                request_id: &request.id,
                subject_ref: &request.subject_ref,
                authority_id: &id,
            },
            self.clock.now(),
        )
    }
}
