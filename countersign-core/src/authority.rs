//! Authority registry: who may sign, and with which key material.
//!
//! The registry maps an [`AuthorityId`] to the Ed25519 keys that authority
//! signs with. Identity proofing (badges, HSMs, tablets) happens upstream;
//! Countersign only checks the signature math against what is registered.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  "grid-ops-lead"     →  public_key  [32 bytes]   veto: yes   │
//! │  "regional-director" →  public_key  [32 bytes]   override key│
//! │  "duty-engineer"     →  public_key  [32 bytes]               │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::crypto::PublicKey;
use crate::error::{Error, Result};
use crate::request::{ApprovalPolicy, AuthorityId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// A registered signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    pub id: AuthorityId,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Key for standard signatures and rejections.
    pub public_key: PublicKey,

    /// May close a request with an explicit rejection.
    #[serde(default)]
    pub veto: bool,

    /// Privileged key for emergency override authorizations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_key: Option<PublicKey>,

    #[serde(default = "default_active")]
    pub active: bool,

    pub registered_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Authority {
    pub fn new(id: impl Into<AuthorityId>, public_key: PublicKey) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            public_key,
            veto: false,
            override_key: None,
            active: true,
            registered_at: Utc::now(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_veto(mut self) -> Self {
        self.veto = true;
        self
    }

    pub fn with_override_key(mut self, key: PublicKey) -> Self {
        self.override_key = Some(key);
        self
    }
}

/// Registry of authorities, keyed by ID.
#[derive(Debug, Clone, Default)]
pub struct AuthorityRegistry {
    authorities: BTreeMap<AuthorityId, Authority>,
}

impl AuthorityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authority. Re-registering an ID replaces the entry.
    pub fn register(&mut self, authority: Authority) {
        info!(
            authority = %authority.id,
            key = %authority.public_key.fingerprint(),
            veto = authority.veto,
            has_override = authority.override_key.is_some(),
            "authority registered"
        );
        self.authorities.insert(authority.id.clone(), authority);
    }

    /// Replace the standard signing key of an authority.
    pub fn rotate_key(&mut self, id: &AuthorityId, new_key: PublicKey) -> Result<()> {
        let authority = self
            .authorities
            .get_mut(id)
            .ok_or_else(|| Error::UnknownAuthority(id.to_string()))?;
        info!(
            authority = %id,
            old_key = %authority.public_key.fingerprint(),
            new_key = %new_key.fingerprint(),
            "authority key rotated"
        );
        authority.public_key = new_key;
        Ok(())
    }

    /// Deactivate an authority; its credentials stop verifying.
    pub fn deactivate(&mut self, id: &AuthorityId) -> Result<()> {
        let authority = self
            .authorities
            .get_mut(id)
            .ok_or_else(|| Error::UnknownAuthority(id.to_string()))?;
        authority.active = false;
        info!(authority = %id, "authority deactivated");
        Ok(())
    }

    /// Look up an active authority.
    pub fn resolve(&self, id: &AuthorityId) -> Result<&Authority> {
        match self.authorities.get(id) {
            Some(a) if a.active => Ok(a),
            _ => Err(Error::UnknownAuthority(id.to_string())),
        }
    }

    pub fn is_active(&self, id: &AuthorityId) -> bool {
        self.authorities.get(id).is_some_and(|a| a.active)
    }

    /// `policy` with its pool narrowed to authorities that can still sign.
    pub fn live_policy(&self, policy: &ApprovalPolicy) -> ApprovalPolicy {
        let mut live = policy.clone();
        live.signers.retain(|a| self.is_active(a));
        live
    }

    pub fn get(&self, id: &AuthorityId) -> Option<&Authority> {
        self.authorities.get(id)
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Authority> {
        self.authorities.values()
    }
}

impl FromIterator<Authority> for AuthorityRegistry {
    fn from_iter<T: IntoIterator<Item = Authority>>(iter: T) -> Self {
        let mut registry = Self::new();
        for authority in iter {
            registry.register(authority);
        }
        registry
    }
}
