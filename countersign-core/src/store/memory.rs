//! In-process store for tests and ephemeral runs.

use super::{AuditFilter, CommitBatch, Store};
use crate::audit::{AuditEntry, ChainHead};
use crate::emergency::EmergencyState;
use crate::error::{Error, Result};
use crate::ledger::SignatureSet;
use crate::request::{AuthorizationRequest, RequestFilter, RequestId, RequestStatus};
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    requests: BTreeMap<RequestId, AuthorizationRequest>,
    signatures: BTreeMap<RequestId, SignatureSet>,
    audit: Vec<AuditEntry>,
    emergency: Option<EmergencyState>,
}

/// [`Store`] backed by maps behind a single `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn commit(&self, batch: CommitBatch) -> Result<()> {
        let mut state = self.state.write().map_err(|_| Error::poisoned("memory store"))?;

        // Validate the whole batch before touching anything.
        let mut next = state.audit.len() as u64 + 1;
        for entry in &batch.audit {
            if entry.sequence_number != next {
                return Err(Error::StorageError(format!(
                    "audit entry {} does not continue chain at {}",
                    entry.sequence_number, next
                )));
            }
            next += 1;
        }
        for record in &batch.signatures {
            let known = batch
                .request
                .as_ref()
                .map_or(false, |r| r.id == record.request_id)
                || state.requests.contains_key(&record.request_id);
            if !known {
                return Err(Error::StorageError(format!(
                    "signature references missing request {}",
                    record.request_id
                )));
            }
            if state
                .signatures
                .get(&record.request_id)
                .map_or(false, |s| s.contains(&record.authority_id))
            {
                return Err(Error::StorageError(format!(
                    "duplicate signature by '{}' on {}",
                    record.authority_id, record.request_id
                )));
            }
        }

        if let Some(request) = batch.request {
            state.requests.insert(request.id.clone(), request);
        }
        for record in batch.signatures {
            state
                .signatures
                .entry(record.request_id.clone())
                .or_default()
                .insert(record);
        }
        state.audit.extend(batch.audit);
        if let Some(emergency) = batch.emergency {
            state.emergency = Some(emergency);
        }
        Ok(())
    }

    fn load_request(&self, id: &RequestId) -> Result<Option<AuthorizationRequest>> {
        let state = self.state.read().map_err(|_| Error::poisoned("memory store"))?;
        Ok(state.requests.get(id).cloned())
    }

    fn load_signatures(&self, id: &RequestId) -> Result<SignatureSet> {
        let state = self.state.read().map_err(|_| Error::poisoned("memory store"))?;
        Ok(state.signatures.get(id).cloned().unwrap_or_default())
    }

    fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<AuthorizationRequest>> {
        let state = self.state.read().map_err(|_| Error::poisoned("memory store"))?;
        let mut out: Vec<_> = state
            .requests
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn open_requests(&self) -> Result<Vec<AuthorizationRequest>> {
        let state = self.state.read().map_err(|_| Error::poisoned("memory store"))?;
        Ok(state
            .requests
            .values()
            .filter(|r| matches!(r.status, RequestStatus::Pending | RequestStatus::Partial))
            .cloned()
            .collect())
    }

    fn audit_entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().map_err(|_| Error::poisoned("memory store"))?;
        let matching = state.audit.iter().filter(|e| filter.matches(e)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    fn audit_page(&self, from: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().map_err(|_| Error::poisoned("memory store"))?;
        let start = from.saturating_sub(1) as usize;
        Ok(state
            .audit
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    fn audit_entry(&self, sequence_number: u64) -> Result<Option<AuditEntry>> {
        let state = self.state.read().map_err(|_| Error::poisoned("memory store"))?;
        Ok(sequence_number
            .checked_sub(1)
            .and_then(|i| state.audit.get(i as usize))
            .cloned())
    }

    fn chain_head(&self) -> Result<ChainHead> {
        let state = self.state.read().map_err(|_| Error::poisoned("memory store"))?;
        Ok(state
            .audit
            .last()
            .map_or_else(ChainHead::genesis, |e| ChainHead {
                last_sequence: e.sequence_number,
                last_hash: e.entry_hash.clone(),
            }))
    }

    fn load_emergency(&self) -> Result<Option<EmergencyState>> {
        let state = self.state.read().map_err(|_| Error::poisoned("memory store"))?;
        Ok(state.emergency.clone())
    }
}
