//! Authorization request lifecycle.
//!
//! [`AuthorizationService`] is the only component that persists request status.
//! Every mutation follows the same shape:
//!
//! ```text
//! lock request ─▶ load ─▶ ledger ─▶ quorum ─▶ lock chain ─▶ seal entries ─▶ commit ─▶ publish
//! ```
//!
//! Mutations of one request are serialized by a per-request lock; different
//! requests proceed in parallel and only meet at the audit chain lock, which
//! is held while entries are sealed and committed.
//!
//! When chain verification finds corruption the service latches it: reads keep
//! working, but requests cannot be created, signed or rejected until an
//! operator calls [`AuthorizationService::acknowledge_corruption`].

use crate::audit::{
    AuditAction, AuditChain, AuditDraft, AuditEntry, AuditSink, ChainHead, ChainVerification,
    ChainVerifier, TracingSink,
};
use crate::authority::{Authority, AuthorityRegistry};
use crate::clock::{Clock, SystemClock};
use crate::credential::{
    CredentialAction, CredentialClass, CredentialProof, CredentialVerifier, Ed25519Verifier,
    SigningClaim,
};
use crate::crypto::PublicKey;
use crate::emergency::{EmergencyLevel, EmergencyState};
use crate::error::{Error, Result};
use crate::ledger::{resolve_key_material, SignatureLedger, SignatureRecord, SignatureSet};
use crate::quorum::{self, QuorumEvaluation};
use crate::request::{
    ApprovalPolicy, AuthorityId, AuthorizationRequest, OverrideGrant, Rejection, RequestFilter,
    RequestId, RequestKind, RequestStatus,
};
use crate::store::{AuditFilter, CommitBatch, Store, AUDIT_PAGE_SIZE};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

/// Default time-to-live of an open request.
pub const DEFAULT_REQUEST_TTL_SECS: u64 = 3600;

/// Subject reference used for audit entries that concern the service itself.
pub const EMERGENCY_SUBJECT: &str = "emergency";
pub const CHAIN_SUBJECT: &str = "audit-chain";

fn default_requester() -> String {
    "incident-engine".to_string()
}

/// Input to [`AuthorizationService::create_request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRequest {
    pub kind: RequestKind,
    pub subject_ref: String,
    pub policy: ApprovalPolicy,
    /// Recorded as the actor of the `create` audit entry.
    #[serde(default = "default_requester")]
    pub requested_by: String,
}

impl NewRequest {
    pub fn packet(subject_ref: impl Into<String>, policy: ApprovalPolicy) -> Self {
        Self {
            kind: RequestKind::Packet,
            subject_ref: subject_ref.into(),
            policy,
            requested_by: default_requester(),
        }
    }

    pub fn decision(subject_ref: impl Into<String>, policy: ApprovalPolicy) -> Self {
        Self {
            kind: RequestKind::Decision,
            ..Self::packet(subject_ref, policy)
        }
    }
}

/// A request together with its signatures and, while open, its quorum state.
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    pub request: AuthorizationRequest,
    pub signatures: SignatureSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quorum: Option<QuorumEvaluation>,
}

/// Chain integrity as seen by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityStatus {
    /// Last position known to verify.
    pub checkpoint: ChainHead,
    /// Set while writes are halted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_at_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntegrityStatus {
    pub fn is_halted(&self) -> bool {
        self.halted_at_sequence.is_some()
    }
}

/// Builder for [`AuthorizationService`].
#[derive(Debug)]
pub struct ServiceBuilder {
    store: Arc<dyn Store>,
    registry: AuthorityRegistry,
    verifier: Arc<dyn CredentialVerifier>,
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    request_ttl: Duration,
}

impl ServiceBuilder {
    pub fn registry(mut self, registry: AuthorityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    /// Resume the chain from the store, restore emergency state and verify the
    /// stored chain from genesis.
    pub fn build(self) -> Result<AuthorizationService> {
        if self.request_ttl <= Duration::zero() {
            return Err(Error::ConfigError("request TTL must be positive".into()));
        }

        let head = self.store.chain_head()?;
        let emergency = self.store.load_emergency()?.unwrap_or_default();
        info!(
            last_sequence = head.last_sequence,
            emergency_active = emergency.active,
            authorities = self.registry.len(),
            "authorization service starting"
        );

        let service = AuthorizationService {
            store: self.store,
            registry: RwLock::new(self.registry),
            verifier: self.verifier,
            sink: self.sink,
            clock: self.clock,
            request_ttl: self.request_ttl,
            chain: AuditChain::resume(head),
            emergency: RwLock::new(emergency),
            request_locks: Mutex::new(HashMap::new()),
            integrity: Mutex::new(IntegrityStatus {
                checkpoint: ChainHead::genesis(),
                halted_at_sequence: None,
                details: None,
            }),
        };
        service.restore_integrity()?;
        Ok(service)
    }
}

/// The lifecycle manager.
#[derive(Debug)]
pub struct AuthorizationService {
    store: Arc<dyn Store>,
    registry: RwLock<AuthorityRegistry>,
    verifier: Arc<dyn CredentialVerifier>,
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    request_ttl: Duration,
    chain: AuditChain,
    emergency: RwLock<EmergencyState>,
    request_locks: Mutex<HashMap<RequestId, Arc<Mutex<()>>>>,
    integrity: Mutex<IntegrityStatus>,
}

impl AuthorizationService {
    /// Start building a service over `store`.
    pub fn builder(store: Arc<dyn Store>) -> ServiceBuilder {
        ServiceBuilder {
            store,
            registry: AuthorityRegistry::new(),
            verifier: Arc::new(Ed25519Verifier),
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            request_ttl: Duration::seconds(DEFAULT_REQUEST_TTL_SECS as i64),
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Open a new request for sign-off.
    ///
    /// # Errors
    ///
    /// `InvalidPolicy` if the threshold is zero, exceeds the signer pool, or a
    /// required signer is outside the pool.
    pub fn create_request(&self, new: NewRequest) -> Result<AuthorizationRequest> {
        self.ensure_writable()?;
        new.policy.validate()?;
        let live = self.registry()?.live_policy(&new.policy);
        if live.signers.len() < live.threshold as usize {
            return Err(Error::UnsatisfiablePolicy {
                signers: live.signers.len(),
                threshold: live.threshold,
            });
        }

        let now = self.clock.now();
        let mut request = AuthorizationRequest {
            id: RequestId::generate(),
            kind: new.kind,
            subject_ref: new.subject_ref,
            policy: new.policy,
            status: RequestStatus::Pending,
            created_at: now,
            expires_at: now + self.request_ttl,
            authorized_at: None,
            closed_at: None,
            previous_chain_hash: None,
            rejection: None,
            override_grant: None,
        };

        let draft = AuditDraft::new(AuditAction::Create, &new.requested_by, &request.subject_ref)
            .request(&request.id)
            .meta("kind", request.kind.as_str())
            .meta("threshold", request.policy.threshold)
            .meta("signers", authority_list(request.policy.signers.iter()))
            .meta(
                "required_signers",
                authority_list(request.policy.required_signers.iter()),
            )
            .meta("expires_at", request.expires_at.to_rfc3339());

        self.commit(vec![draft], now, |entries| {
            request.previous_chain_hash = entries.first().map(|e| e.previous_entry_hash.clone());
            CommitBatch::new().request(request.clone()).audit(entries)
        })?;

        info!(
            request_id = %request.id,
            kind = request.kind.as_str(),
            subject = %request.subject_ref,
            threshold = request.policy.threshold,
            signers = request.policy.signers.len(),
            "authorization request created"
        );
        Ok(request)
    }

    /// Record a signature under the current emergency state.
    pub fn submit_signature(
        &self,
        request_id: &RequestId,
        authority_id: &AuthorityId,
        proof: &CredentialProof,
    ) -> Result<AuthorizationRequest> {
        let emergency = self.emergency_state()?;
        self.submit_signature_with(request_id, authority_id, proof, &emergency)
    }

    /// Record a signature and re-evaluate the quorum under `emergency`.
    ///
    /// Re-signing is idempotent. A proof of class `EmergencyOverride` takes the
    /// override path when the quorum is not otherwise met.
    ///
    /// # Errors
    ///
    /// - `UnknownRequest`, `AlreadyTerminal` for missing or closed requests.
    /// - `UnauthorizedSigner`, `InvalidCredential` from the ledger.
    /// - `ChainCorruption` while writes are halted.
    pub fn submit_signature_with(
        &self,
        request_id: &RequestId,
        authority_id: &AuthorityId,
        proof: &CredentialProof,
        emergency: &EmergencyState,
    ) -> Result<AuthorizationRequest> {
        self.ensure_writable()?;
        let lock = self.request_lock(request_id)?;
        let _guard = lock.lock().map_err(|_| Error::poisoned("request"))?;

        let now = self.clock.now();
        let request = self.load_open(request_id, now)?;
        let signatures = self.store.load_signatures(request_id)?;

        if proof.class == CredentialClass::EmergencyOverride && !emergency.active {
            return Err(Error::InvalidCredential(
                "override credential presented outside an active emergency".into(),
            ));
        }

        let (outcome, policy) = {
            let registry = self.registry()?;
            let outcome = SignatureLedger::new(&registry, self.verifier.as_ref())
                .record_signature(&request, &signatures, authority_id, proof, now)?;
            (outcome, registry.live_policy(&request.policy))
        };
        // Deactivated authorities leave the pool; too few left fails closed.
        let evaluation = quorum::evaluate(&policy, &outcome.signatures, emergency)?;

        let mut drafts = Vec::new();
        if let Some(record) = &outcome.recorded {
            drafts.push(sign_draft(&request, record, &evaluation));
        }

        let mut updated = request.clone();
        if proof.class == CredentialClass::EmergencyOverride && !evaluation.is_authorized() {
            if !evaluation.missing_required.is_empty() {
                return Err(Error::UnauthorizedSigner {
                    authority: authority_id.to_string(),
                    request_id: request_id.to_string(),
                    reason: format!(
                        "override cannot stand in for required signers: {}",
                        authority_list(evaluation.missing_required.iter()).join(", ")
                    ),
                });
            }
            let grant = OverrideGrant {
                authority_id: authority_id.clone(),
                override_key_fingerprint: outcome.verified.key_fingerprint.clone(),
                bypassed_threshold: evaluation.effective_threshold,
                signatures_at_override: evaluation.signature_count,
            };
            drafts.push(override_draft(&request, &grant, &evaluation, emergency));
            warn!(
                request_id = %request_id,
                authority = %authority_id,
                level = %emergency.level,
                signatures = evaluation.signature_count,
                bypassed_threshold = evaluation.effective_threshold,
                "request authorized by emergency override"
            );
            updated.status = RequestStatus::Authorized;
            updated.authorized_at = Some(now);
            updated.closed_at = Some(now);
            updated.override_grant = Some(grant);
        } else {
            let status = evaluation.state.status();
            if status != request.status {
                updated.status = status;
                if status == RequestStatus::Authorized {
                    updated.authorized_at = Some(now);
                    updated.closed_at = Some(now);
                    drafts.push(authorize_draft(&request, authority_id, &evaluation));
                    info!(
                        request_id = %request_id,
                        signatures = evaluation.signature_count,
                        effective_threshold = evaluation.effective_threshold,
                        relaxed = evaluation.relaxed_by.is_some(),
                        "request authorized"
                    );
                }
            }
        }

        if drafts.is_empty() {
            // Idempotent re-sign with nothing to change.
            return Ok(request);
        }

        let recorded = outcome.recorded;
        self.commit(drafts, now, |entries| {
            let mut batch = CommitBatch::new().request(updated.clone()).audit(entries);
            if let Some(record) = recorded {
                batch = batch.signature(record);
            }
            batch
        })?;
        debug!(
            request_id = %request_id,
            authority = %authority_id,
            status = %updated.status,
            "signature committed"
        );

        if updated.is_terminal() {
            self.release_lock(request_id);
        }
        Ok(updated)
    }

    /// Close a request by explicit rejection.
    ///
    /// Only an eligible signer holding a veto right may reject, and only while
    /// the request is PENDING or PARTIAL.
    pub fn reject_request(
        &self,
        request_id: &RequestId,
        authority_id: &AuthorityId,
        reason: &str,
        proof: &CredentialProof,
    ) -> Result<AuthorizationRequest> {
        self.ensure_writable()?;
        let lock = self.request_lock(request_id)?;
        let _guard = lock.lock().map_err(|_| Error::poisoned("request"))?;

        let now = self.clock.now();
        let request = self.load_open(request_id, now)?;

        let verified = {
            let registry = self.registry()?;
            let unauthorized = |reason: &str| Error::UnauthorizedSigner {
                authority: authority_id.to_string(),
                request_id: request_id.to_string(),
                reason: reason.to_string(),
            };
            if !request.policy.is_eligible(authority_id) {
                return Err(unauthorized("not in the eligible signer pool"));
            }
            let authority = resolve_key_material(&registry, authority_id)?;
            if !authority.veto {
                return Err(unauthorized("holds no veto right"));
            }
            if proof.class != CredentialClass::Standard {
                return Err(Error::InvalidCredential(
                    "rejections must use a standard credential".into(),
                ));
            }
            let claim = SigningClaim {
                action: CredentialAction::Reject,
                request_id,
                subject_ref: &request.subject_ref,
                authority_id,
            };
            self.verifier.verify(authority, &claim, proof, now)?
        };

        let signature_count = self.store.load_signatures(request_id)?.len();
        let mut updated = request.clone();
        updated.status = RequestStatus::Rejected;
        updated.closed_at = Some(now);
        updated.rejection = Some(Rejection {
            authority_id: authority_id.clone(),
            reason: reason.to_string(),
            rejected_at: now,
        });

        let draft =
            AuditDraft::new(AuditAction::Reject, authority_id.as_str(), &request.subject_ref)
                .request(request_id)
                .meta("reason", reason)
                .meta("key_fingerprint", verified.key_fingerprint)
                .meta("previous_status", request.status.as_str())
                .meta("signature_count", signature_count);
        self.commit(vec![draft], now, |entries| {
            CommitBatch::new().request(updated.clone()).audit(entries)
        })?;

        info!(
            request_id = %request_id,
            authority = %authority_id,
            reason,
            "request rejected"
        );
        self.release_lock(request_id);
        Ok(updated)
    }

    /// Fetch a request, expiring it first if its TTL has elapsed.
    pub fn get_request(&self, request_id: &RequestId) -> Result<AuthorizationRequest> {
        let request = self
            .store
            .load_request(request_id)?
            .ok_or_else(|| Error::UnknownRequest(request_id.to_string()))?;
        if request.is_expired_at(self.clock.now()) && !self.integrity()?.is_halted() {
            if let Some(expired) = self.expire_if_due(request_id)? {
                return Ok(expired);
            }
            return self
                .store
                .load_request(request_id)?
                .ok_or_else(|| Error::UnknownRequest(request_id.to_string()));
        }
        Ok(request)
    }

    /// Request, signatures and (while open) the current quorum evaluation.
    pub fn get_request_view(&self, request_id: &RequestId) -> Result<RequestView> {
        let request = self.get_request(request_id)?;
        let signatures = self.store.load_signatures(request_id)?;
        let quorum = if request.is_terminal() {
            None
        } else {
            let policy = self.registry()?.live_policy(&request.policy);
            Some(quorum::evaluate(
                &policy,
                &signatures,
                &self.emergency_state()?,
            )?)
        };
        Ok(RequestView {
            request,
            signatures,
            quorum,
        })
    }

    /// List requests, newest first. Overdue requests are expired beforehand.
    pub fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<AuthorizationRequest>> {
        if !self.integrity()?.is_halted() {
            self.sweep_expired()?;
        }
        self.store.list_requests(filter)
    }

    /// Expire every open request whose TTL has elapsed.
    ///
    /// Does nothing while writes are halted.
    pub fn sweep_expired(&self) -> Result<Vec<AuthorizationRequest>> {
        if self.integrity()?.is_halted() {
            debug!("expiry sweep skipped: audit chain writes halted");
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut expired = Vec::new();
        for request in self.store.open_requests()? {
            if request.is_expired_at(now) {
                if let Some(r) = self.expire_if_due(&request.id)? {
                    expired.push(r);
                }
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired overdue requests");
        }
        Ok(expired)
    }

    // ========================================================================
    // Audit
    // ========================================================================

    pub fn get_audit_log(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.store.audit_entries(filter)
    }

    /// Verify the chain.
    ///
    /// With `None`, verification is incremental from the last verified
    /// checkpoint. With a range, entries in the range are verified against
    /// the stored hash of the entry before it.
    pub fn verify_chain(&self, range: Option<RangeInclusive<u64>>) -> Result<ChainVerification> {
        let head = self.chain.head()?;
        let checkpoint = self.integrity()?.checkpoint;
        let Some(range) = range else {
            let verification = self.walk(checkpoint, head.last_sequence)?;
            self.record_verification(&verification, true)?;
            return Ok(verification);
        };

        let start = (*range.start()).max(1);
        let end = (*range.end()).min(head.last_sequence);
        if start > end {
            return Ok(ChainVerification {
                valid: true,
                first_invalid_sequence: None,
                entries_checked: 0,
                verified_through: None,
                details: None,
            });
        }
        let verification = match self.anchor_before(start)? {
            Some(anchor) => self.walk(anchor, end)?,
            None => ChainVerification {
                valid: false,
                first_invalid_sequence: Some(start - 1),
                entries_checked: 0,
                verified_through: None,
                details: Some(format!("entry {} is missing", start - 1)),
            },
        };
        // A range only moves the checkpoint when it continues from it.
        let contiguous = start <= checkpoint.last_sequence + 1;
        self.record_verification(&verification, contiguous)?;
        Ok(verification)
    }

    /// Verify the whole chain from genesis.
    pub fn verify_chain_full(&self) -> Result<ChainVerification> {
        let head = self.chain.head()?;
        let verification = self.walk(ChainHead::genesis(), head.last_sequence)?;
        self.record_verification(&verification, true)?;
        Ok(verification)
    }

    /// Clear a latched corruption. The acknowledgment itself is audited and
    /// becomes the new verification checkpoint.
    ///
    /// Returns `None` when nothing was halted.
    pub fn acknowledge_corruption(&self, operator: &str, note: &str) -> Result<Option<AuditEntry>> {
        let status = self.integrity()?;
        let Some(sequence) = status.halted_at_sequence else {
            return Ok(None);
        };

        let draft = AuditDraft::new(AuditAction::CorruptionAcknowledged, operator, CHAIN_SUBJECT)
            .meta("halted_at_sequence", sequence)
            .meta("details", status.details.clone().unwrap_or_default())
            .meta("note", note);
        // Bypasses the halt check: this is the one write allowed while halted.
        let entry = self.chain.append(draft, self.clock.now(), |entry| {
            self.store
                .commit(CommitBatch::new().audit(std::slice::from_ref(entry)))
        })?;
        self.sink.record(&entry);

        let mut integrity = self.integrity.lock().map_err(|_| Error::poisoned("integrity"))?;
        if integrity.halted_at_sequence == Some(sequence) {
            integrity.halted_at_sequence = None;
            integrity.details = None;
        }
        integrity.checkpoint = ChainHead {
            last_sequence: entry.sequence_number,
            last_hash: entry.entry_hash.clone(),
        };
        warn!(
            operator,
            halted_at_sequence = sequence,
            "audit chain corruption acknowledged; writes resumed"
        );
        Ok(Some(entry))
    }

    pub fn integrity(&self) -> Result<IntegrityStatus> {
        Ok(self
            .integrity
            .lock()
            .map_err(|_| Error::poisoned("integrity"))?
            .clone())
    }

    pub fn chain_head(&self) -> Result<ChainHead> {
        self.chain.head()
    }

    // ========================================================================
    // Emergency control
    // ========================================================================

    pub fn emergency_state(&self) -> Result<EmergencyState> {
        Ok(self
            .emergency
            .read()
            .map_err(|_| Error::poisoned("emergency"))?
            .clone())
    }

    /// Enter emergency mode at `level`.
    pub fn activate_emergency(
        &self,
        level: EmergencyLevel,
        actor: &AuthorityId,
    ) -> Result<EmergencyState> {
        let now = self.clock.now();
        let state = EmergencyState::activated(level, now, actor.clone());
        self.set_emergency(state, AuditAction::EmergencyActivate, actor, now)
    }

    /// Return to normal operations.
    pub fn deactivate_emergency(&self, actor: &AuthorityId) -> Result<EmergencyState> {
        let now = self.clock.now();
        self.set_emergency(
            EmergencyState::inactive(),
            AuditAction::EmergencyDeactivate,
            actor,
            now,
        )
    }

    // ========================================================================
    // Authorities
    // ========================================================================

    pub fn register_authority(&self, authority: Authority) -> Result<()> {
        self.registry
            .write()
            .map_err(|_| Error::poisoned("registry"))?
            .register(authority);
        Ok(())
    }

    pub fn rotate_authority_key(&self, id: &AuthorityId, key: PublicKey) -> Result<()> {
        self.registry
            .write()
            .map_err(|_| Error::poisoned("registry"))?
            .rotate_key(id, key)
    }

    pub fn deactivate_authority(&self, id: &AuthorityId) -> Result<()> {
        self.registry
            .write()
            .map_err(|_| Error::poisoned("registry"))?
            .deactivate(id)
    }

    pub fn authorities(&self) -> Result<Vec<Authority>> {
        Ok(self.registry()?.iter().cloned().collect())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn registry(&self) -> Result<RwLockReadGuard<'_, AuthorityRegistry>> {
        self.registry.read().map_err(|_| Error::poisoned("registry"))
    }

    fn ensure_writable(&self) -> Result<()> {
        let integrity = self.integrity()?;
        match integrity.halted_at_sequence {
            Some(sequence) => Err(Error::ChainCorruption {
                sequence,
                details: "writes halted until an operator acknowledges the corruption".into(),
            }),
            None => Ok(()),
        }
    }

    /// Seal `drafts`, commit them with the batch built by `build`, publish.
    fn commit<F>(
        &self,
        drafts: Vec<AuditDraft>,
        now: DateTime<Utc>,
        build: F,
    ) -> Result<Vec<AuditEntry>>
    where
        F: FnOnce(&[AuditEntry]) -> CommitBatch,
    {
        let (entries, ()) = self.chain.append_all(drafts, now, |entries| {
            // Re-checked under the chain lock so a latch cannot race a write.
            self.ensure_writable()?;
            self.store.commit(build(entries))
        })?;
        for entry in &entries {
            self.sink.record(entry);
        }
        Ok(entries)
    }

    fn request_lock(&self, id: &RequestId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .request_locks
            .lock()
            .map_err(|_| Error::poisoned("request lock table"))?;
        Ok(locks.entry(id.clone()).or_default().clone())
    }

    // Terminal requests never change again, so their lock can go.
    fn release_lock(&self, id: &RequestId) {
        if let Ok(mut locks) = self.request_locks.lock() {
            locks.remove(id);
        }
    }

    /// Load a request that must still accept signatures. Caller holds its lock.
    ///
    /// Unknown and closed requests give their lock table entry back.
    fn load_open(&self, id: &RequestId, now: DateTime<Utc>) -> Result<AuthorizationRequest> {
        let Some(mut request) = self.store.load_request(id)? else {
            self.release_lock(id);
            return Err(Error::UnknownRequest(id.to_string()));
        };
        if request.is_expired_at(now) {
            request = self.expire_locked(request, now)?;
        }
        if request.is_terminal() {
            self.release_lock(id);
            return Err(Error::AlreadyTerminal {
                request_id: id.to_string(),
                status: request.status.to_string(),
            });
        }
        Ok(request)
    }

    fn expire_if_due(&self, id: &RequestId) -> Result<Option<AuthorizationRequest>> {
        let lock = self.request_lock(id)?;
        let _guard = lock.lock().map_err(|_| Error::poisoned("request"))?;
        let now = self.clock.now();
        match self.store.load_request(id)? {
            Some(request) if request.is_expired_at(now) => {
                self.expire_locked(request, now).map(Some)
            }
            Some(request) if !request.is_terminal() => Ok(None),
            _ => {
                self.release_lock(id);
                Ok(None)
            }
        }
    }

    fn expire_locked(
        &self,
        request: AuthorizationRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthorizationRequest> {
        let signature_count = self.store.load_signatures(&request.id)?.len();
        let mut updated = request.clone();
        updated.status = RequestStatus::Expired;
        updated.closed_at = Some(now);

        let draft = AuditDraft::new(AuditAction::Expire, "system", &request.subject_ref)
            .request(&request.id)
            .meta("expires_at", request.expires_at.to_rfc3339())
            .meta("previous_status", request.status.as_str())
            .meta("signature_count", signature_count);
        self.commit(vec![draft], now, |entries| {
            CommitBatch::new().request(updated.clone()).audit(entries)
        })?;

        info!(request_id = %request.id, signatures = signature_count, "request expired");
        self.release_lock(&request.id);
        Ok(updated)
    }

    fn set_emergency(
        &self,
        state: EmergencyState,
        action: AuditAction,
        actor: &AuthorityId,
        now: DateTime<Utc>,
    ) -> Result<EmergencyState> {
        self.ensure_writable()?;
        let previous = self.emergency_state()?;
        let draft = AuditDraft::new(action, actor.as_str(), EMERGENCY_SUBJECT)
            .meta("level", state.level.as_str())
            .meta("active", state.active)
            .meta("previous_level", previous.level.as_str())
            .meta("previous_active", previous.active)
            .meta("relaxes_threshold", state.relaxes_threshold());

        let (entries, ()) = self.chain.append_all(vec![draft], now, |entries| {
            self.ensure_writable()?;
            self.store
                .commit(CommitBatch::new().audit(entries).emergency(state.clone()))?;
            // Updated under the chain lock so memory follows commit order.
            *self
                .emergency
                .write()
                .map_err(|_| Error::poisoned("emergency"))? = state.clone();
            Ok(())
        })?;
        for entry in &entries {
            self.sink.record(entry);
        }

        warn!(
            actor = %actor,
            active = state.active,
            level = %state.level,
            relaxes_threshold = state.relaxes_threshold(),
            "emergency state changed"
        );
        Ok(state)
    }

    /// Stored hash of the entry before `start`, as a verification anchor.
    fn anchor_before(&self, start: u64) -> Result<Option<ChainHead>> {
        if start <= 1 {
            return Ok(Some(ChainHead::genesis()));
        }
        Ok(self.store.audit_entry(start - 1)?.map(|e| ChainHead {
            last_sequence: e.sequence_number,
            last_hash: e.entry_hash,
        }))
    }

    /// Walk stored entries after `anchor` up to `through`.
    fn walk(&self, anchor: ChainHead, through: u64) -> Result<ChainVerification> {
        let mut next = anchor.last_sequence + 1;
        let mut verifier = ChainVerifier::anchored(anchor);
        'pages: while next <= through {
            let page = self.store.audit_page(next, AUDIT_PAGE_SIZE)?;
            if page.is_empty() {
                break;
            }
            for entry in &page {
                if entry.sequence_number > through {
                    break 'pages;
                }
                if !verifier.push(entry) {
                    break 'pages;
                }
                next = entry.sequence_number + 1;
            }
        }
        verifier.expect_through(through);
        Ok(verifier.finish())
    }

    fn record_verification(&self, verification: &ChainVerification, advance: bool) -> Result<()> {
        if verification.valid {
            if advance {
                if let Some(through) = &verification.verified_through {
                    let mut integrity =
                        self.integrity.lock().map_err(|_| Error::poisoned("integrity"))?;
                    if through.last_sequence > integrity.checkpoint.last_sequence {
                        integrity.checkpoint = through.clone();
                    }
                }
            }
            debug!(
                checked = verification.entries_checked,
                "audit chain verified"
            );
            return Ok(());
        }
        self.latch(verification)
    }

    fn latch(&self, verification: &ChainVerification) -> Result<()> {
        let mut integrity = self.integrity.lock().map_err(|_| Error::poisoned("integrity"))?;
        if integrity.halted_at_sequence.is_none() {
            integrity.halted_at_sequence = verification.first_invalid_sequence;
            integrity.details = verification.details.clone();
        }
        drop(integrity);
        error!(
            first_invalid_sequence = ?verification.first_invalid_sequence,
            details = ?verification.details,
            "audit chain verification failed"
        );
        self.sink.on_corruption(verification);
        Ok(())
    }

    /// Verify the stored chain at startup, skipping over breaks an operator
    /// has already acknowledged.
    fn restore_integrity(&self) -> Result<()> {
        let head = self.chain.head()?;
        let mut anchor = ChainHead::genesis();
        loop {
            let verification = self.walk(anchor.clone(), head.last_sequence)?;
            let Some(broken_at) = verification.first_invalid_sequence else {
                let mut integrity =
                    self.integrity.lock().map_err(|_| Error::poisoned("integrity"))?;
                integrity.checkpoint = verification.verified_through.unwrap_or(anchor);
                return Ok(());
            };

            let acknowledged = self
                .store
                .audit_entries(&AuditFilter {
                    action: Some(AuditAction::CorruptionAcknowledged),
                    from_sequence: Some(broken_at + 1),
                    ..Default::default()
                })?
                .into_iter()
                .find(|e| {
                    e.metadata.get("halted_at_sequence").and_then(|v| v.as_u64()) == Some(broken_at)
                });

            match acknowledged {
                Some(ack) => {
                    warn!(
                        broken_at,
                        acknowledged_by = %ack.actor,
                        acknowledged_at = ack.sequence_number,
                        "resuming verification after acknowledged corruption"
                    );
                    anchor = ChainHead {
                        last_sequence: ack.sequence_number - 1,
                        last_hash: ack.previous_entry_hash,
                    };
                }
                None => return self.latch(&verification),
            }
        }
    }
}

fn authority_list<'a>(ids: impl Iterator<Item = &'a AuthorityId>) -> Vec<String> {
    ids.map(|a| a.to_string()).collect()
}

fn sign_draft(
    request: &AuthorizationRequest,
    record: &SignatureRecord,
    evaluation: &QuorumEvaluation,
) -> AuditDraft {
    AuditDraft::new(AuditAction::Sign, record.authority_id.as_str(), &request.subject_ref)
        .request(&request.id)
        .meta("key_fingerprint", record.key_fingerprint.clone())
        .meta("credential_class", record.proof.class.as_str())
        .meta("signed_at", record.signed_at.to_rfc3339())
        .meta("signature_count", evaluation.signature_count)
        .meta("effective_threshold", evaluation.effective_threshold)
        .meta("status", evaluation.state.status().as_str())
}

fn authorize_draft(
    request: &AuthorizationRequest,
    final_signer: &AuthorityId,
    evaluation: &QuorumEvaluation,
) -> AuditDraft {
    let mut draft = AuditDraft::new(
        AuditAction::Authorize,
        final_signer.as_str(),
        &request.subject_ref,
    )
    .request(&request.id)
    .meta("base_threshold", evaluation.base_threshold)
    .meta("effective_threshold", evaluation.effective_threshold)
    .meta("signature_count", evaluation.signature_count)
    .meta("rationale", evaluation.rationale.clone());
    if let Some(level) = evaluation.relaxed_by {
        draft = draft.meta("emergency_level", level.as_str());
    }
    draft
}

fn override_draft(
    request: &AuthorizationRequest,
    grant: &OverrideGrant,
    evaluation: &QuorumEvaluation,
    emergency: &EmergencyState,
) -> AuditDraft {
    AuditDraft::new(
        AuditAction::OverrideAuthorize,
        grant.authority_id.as_str(),
        &request.subject_ref,
    )
    .request(&request.id)
    .meta("override_key_fingerprint", grant.override_key_fingerprint.clone())
    .meta("emergency_level", emergency.level.as_str())
    .meta("bypassed_threshold", grant.bypassed_threshold)
    .meta("base_threshold", evaluation.base_threshold)
    .meta("signature_count", grant.signatures_at_override)
    .meta(
        "rationale",
        format!(
            "emergency override by {} under {} emergency with {} of {} signatures",
            grant.authority_id,
            emergency.level,
            grant.signatures_at_override,
            grant.bypassed_threshold
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::SigningKey;
    use crate::store::MemoryStore;

    struct Harness {
        service: AuthorizationService,
        keys: HashMap<&'static str, SigningKey>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let mut keys = HashMap::new();
        let mut registry = AuthorityRegistry::new();
        for name in ["A", "B", "C"] {
            let key = SigningKey::generate();
            let mut authority = Authority::new(name, key.public_key());
            if name == "A" {
                authority = authority.with_veto();
            }
            registry.register(authority);
            keys.insert(name, key);
        }
        let clock = Arc::new(ManualClock::default());
        let service = AuthorizationService::builder(Arc::new(MemoryStore::new()))
            .registry(registry)
            .clock(clock.clone())
            .build()
            .unwrap();
        Harness {
            service,
            keys,
            clock,
        }
    }

    impl Harness {
        fn create(&self, threshold: u32) -> AuthorizationRequest {
            self.service
                .create_request(NewRequest::packet(
                    "incident-1/isolate-feeder",
                    ApprovalPolicy::new(threshold, ["A", "B", "C"]),
                ))
                .unwrap()
        }

        fn sign(
            &self,
            request: &AuthorizationRequest,
            who: &'static str,
        ) -> Result<AuthorizationRequest> {
            let id = AuthorityId::new(who);
            let proof = CredentialProof::create(
                &self.keys[who],
                CredentialClass::Standard,
                &SigningClaim {
                    action: CredentialAction::Sign,
                    request_id: &request.id,
                    subject_ref: &request.subject_ref,
                    authority_id: &id,
                },
                self.clock.now(),
            );
            self.service.submit_signature(&request.id, &id, &proof)
        }
    }

    #[test]
    fn test_create_anchors_previous_chain_hash() {
        let h = harness();
        let first = h.create(2);
        assert_eq!(first.previous_chain_hash.as_deref(), Some(crate::GENESIS_HASH));
        let head = h.service.chain_head().unwrap();
        let second = h.create(2);
        assert_eq!(second.previous_chain_hash, Some(head.last_hash));
    }

    #[test]
    fn test_partial_then_authorized() {
        let h = harness();
        let request = h.create(2);
        let after_a = h.sign(&request, "A").unwrap();
        assert_eq!(after_a.status, RequestStatus::Partial);
        let after_b = h.sign(&request, "B").unwrap();
        assert_eq!(after_b.status, RequestStatus::Authorized);
        assert!(after_b.authorized_at.is_some());

        let actions: Vec<_> = h
            .service
            .get_audit_log(&AuditFilter::default())
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Create,
                AuditAction::Sign,
                AuditAction::Sign,
                AuditAction::Authorize
            ]
        );
    }

    #[test]
    fn test_expiry_is_lazy_on_read() {
        let h = harness();
        let request = h.create(2);
        h.clock.advance(Duration::seconds(DEFAULT_REQUEST_TTL_SECS as i64 + 1));
        let read = h.service.get_request(&request.id).unwrap();
        assert_eq!(read.status, RequestStatus::Expired);

        let err = h.sign(&request, "A").unwrap_err();
        assert!(matches!(err, Error::AlreadyTerminal { .. }));
    }

    #[test]
    fn test_sweep_expires_overdue_requests() {
        let h = harness();
        let old = h.create(2);
        h.clock.advance(Duration::seconds(DEFAULT_REQUEST_TTL_SECS as i64 - 10));
        let fresh = h.create(2);
        h.clock.advance(Duration::seconds(20));

        let expired = h.service.sweep_expired().unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
        assert_eq!(
            h.service.get_request(&fresh.id).unwrap().status,
            RequestStatus::Pending
        );
    }

    #[test]
    fn test_reject_requires_veto() {
        let h = harness();
        let request = h.create(2);
        let b = AuthorityId::new("B");
        let proof = CredentialProof::reject(&h.keys["B"], &request.id, &request.subject_ref, &b);
        let err = h
            .service
            .reject_request(&request.id, &b, "not safe", &proof)
            .unwrap_err();
        assert!(matches!(err, Error::UnauthorizedSigner { .. }));

        let a = AuthorityId::new("A");
        let proof = CredentialProof::reject(&h.keys["A"], &request.id, &request.subject_ref, &a);
        let rejected = h
            .service
            .reject_request(&request.id, &a, "not safe", &proof)
            .unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);
        assert_eq!(rejected.rejection.unwrap().reason, "not safe");
    }

    #[test]
    fn test_emergency_state_is_audited() {
        let h = harness();
        let admin = AuthorityId::new("admin");
        h.service
            .activate_emergency(EmergencyLevel::War, &admin)
            .unwrap();
        assert!(h.service.emergency_state().unwrap().relaxes_threshold());
        h.service.deactivate_emergency(&admin).unwrap();
        assert!(!h.service.emergency_state().unwrap().active);

        let log = h.service.get_audit_log(&AuditFilter::default()).unwrap();
        assert_eq!(log[0].action, AuditAction::EmergencyActivate);
        assert_eq!(log[1].action, AuditAction::EmergencyDeactivate);
        assert!(h.service.verify_chain_full().unwrap().valid);
    }

    #[test]
    fn test_incremental_verification_advances_checkpoint() {
        let h = harness();
        h.create(1);
        let first = h.service.verify_chain(None).unwrap();
        assert_eq!(first.entries_checked, 1);
        h.create(1);
        h.create(1);
        let second = h.service.verify_chain(None).unwrap();
        assert!(second.valid);
        assert_eq!(second.entries_checked, 2);
        assert_eq!(h.service.integrity().unwrap().checkpoint.last_sequence, 3);
    }

    #[test]
    fn test_unknown_and_closed_requests_leave_no_lock_entries() {
        let h = harness();
        let a = AuthorityId::new("A");
        for _ in 0..100 {
            let id = RequestId::generate();
            let sign = CredentialProof::sign(&h.keys["A"], &id, "incident-1", &a);
            let err = h.service.submit_signature(&id, &a, &sign).unwrap_err();
            assert!(matches!(err, Error::UnknownRequest(_)));
            let reject = CredentialProof::reject(&h.keys["A"], &id, "incident-1", &a);
            let err = h
                .service
                .reject_request(&id, &a, "not safe", &reject)
                .unwrap_err();
            assert!(matches!(err, Error::UnknownRequest(_)));
        }

        let request = h.create(2);
        h.sign(&request, "A").unwrap();
        h.sign(&request, "B").unwrap();
        let err = h.sign(&request, "C").unwrap_err();
        assert!(matches!(err, Error::AlreadyTerminal { .. }));

        assert!(h.service.request_locks.lock().unwrap().is_empty());
    }
}
