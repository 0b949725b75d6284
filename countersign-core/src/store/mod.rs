//! Durable state behind a [`Store`] trait.
//!
//! A request, its new signature records and the audit entries describing the
//! change are written together through [`Store::commit`]; either all of them
//! land or none do. There is no update or delete path for audit entries.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::audit::{AuditAction, AuditEntry, ChainHead};
use crate::emergency::EmergencyState;
use crate::error::Result;
use crate::ledger::{SignatureRecord, SignatureSet};
use crate::request::{AuthorizationRequest, RequestFilter, RequestId};
use serde::{Deserialize, Serialize};

/// Default page size when reading the audit chain.
pub const AUDIT_PAGE_SIZE: usize = 1024;

/// Everything one state transition writes.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    /// Inserted or replaced by ID.
    pub request: Option<AuthorizationRequest>,
    pub signatures: Vec<SignatureRecord>,
    /// Must continue the stored chain without gaps.
    pub audit: Vec<AuditEntry>,
    pub emergency: Option<EmergencyState>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(mut self, request: AuthorizationRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn signature(mut self, record: SignatureRecord) -> Self {
        self.signatures.push(record);
        self
    }

    pub fn audit(mut self, entries: &[AuditEntry]) -> Self {
        self.audit.extend_from_slice(entries);
        self
    }

    pub fn emergency(mut self, state: EmergencyState) -> Self {
        self.emergency = Some(state);
        self
    }
}

/// Filter for `get_audit_log`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub action: Option<AuditAction>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub subject_ref: Option<String>,
    #[serde(default)]
    pub request_id: Option<RequestId>,
    /// Only entries with `sequence_number >= from_sequence`.
    #[serde(default)]
    pub from_sequence: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.action.map_or(true, |a| a == entry.action)
            && self.actor.as_deref().map_or(true, |a| a == entry.actor)
            && self
                .subject_ref
                .as_deref()
                .map_or(true, |s| s == entry.subject_ref)
            && self
                .request_id
                .as_ref()
                .map_or(true, |r| entry.request_id.as_ref() == Some(r))
            && self
                .from_sequence
                .map_or(true, |from| entry.sequence_number >= from)
    }
}

/// Persistence for requests, signatures, the audit chain and emergency state.
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Atomically apply a batch.
    fn commit(&self, batch: CommitBatch) -> Result<()>;

    fn load_request(&self, id: &RequestId) -> Result<Option<AuthorizationRequest>>;

    fn load_signatures(&self, id: &RequestId) -> Result<SignatureSet>;

    /// Requests matching `filter`, newest first.
    fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<AuthorizationRequest>>;

    /// Requests still in PENDING or PARTIAL.
    fn open_requests(&self) -> Result<Vec<AuthorizationRequest>>;

    /// Audit entries matching `filter`, ascending by sequence number.
    fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;

    /// Up to `limit` entries with `sequence_number >= from`, ascending.
    fn audit_page(&self, from: u64, limit: usize) -> Result<Vec<AuditEntry>>;

    fn audit_entry(&self, sequence_number: u64) -> Result<Option<AuditEntry>>;

    /// Last stored sequence number and hash, or genesis.
    fn chain_head(&self) -> Result<ChainHead>;

    fn load_emergency(&self) -> Result<Option<EmergencyState>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditChain, AuditDraft};
    use chrono::Utc;

    #[test]
    fn test_audit_filter_matches() {
        let chain = AuditChain::new();
        let entry = chain
            .append(
                AuditDraft::new(AuditAction::Reject, "grid-ops", "incident-9"),
                Utc::now(),
                |_| Ok(()),
            )
            .unwrap();

        assert!(AuditFilter::default().matches(&entry));
        let by_action = AuditFilter {
            action: Some(AuditAction::Reject),
            ..Default::default()
        };
        assert!(by_action.matches(&entry));
        let by_actor = AuditFilter {
            actor: Some("someone-else".into()),
            ..Default::default()
        };
        assert!(!by_actor.matches(&entry));
        let later = AuditFilter {
            from_sequence: Some(2),
            ..Default::default()
        };
        assert!(!later.matches(&entry));
    }
}
