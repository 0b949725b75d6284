//! # Countersign Core
//!
//! M-of-N authorization for high-consequence actions.
//!
//! A request (a response packet or a decision) is opened with an approval
//! policy naming the eligible signers and how many of them must sign. Each
//! signature is verified against a registered authority, recorded once per
//! authority, and the quorum is re-evaluated. During a national emergency or
//! war the threshold is relaxed to 67% of its base. Every state change is
//! appended to a SHA-256 hash-linked audit chain that can be verified offline.
//!
//! ## Key Concepts
//!
//! - **Signature Ledger**: the distinct authorities that have signed a request
//! - **Quorum Evaluator**: pure function of policy, signatures and emergency state
//! - **Lifecycle Manager**: the only component that persists request status
//! - **Audit Chain**: append-only, gapless, tamper-evident log
//!
//! ## Example
//!
//! ```rust,ignore
//! use countersign::{
//!     ApprovalPolicy, Authority, AuthorityId, AuthorityRegistry, AuthorizationService,
//!     CredentialProof, MemoryStore, NewRequest, SigningKey,
//! };
//! use std::sync::Arc;
//!
//! let alice = SigningKey::generate();
//! let bob = SigningKey::generate();
//! let registry: AuthorityRegistry = [
//!     Authority::new("alice", alice.public_key()),
//!     Authority::new("bob", bob.public_key()),
//! ]
//! .into_iter()
//! .collect();
//!
//! let service = AuthorizationService::builder(Arc::new(MemoryStore::new()))
//!     .registry(registry)
//!     .build()?;
//!
//! let request = service.create_request(NewRequest::packet(
//!     "incident-42",
//!     ApprovalPolicy::new(2, ["alice", "bob"]),
//! ))?;
//!
//! let alice_id = AuthorityId::new("alice");
//! let proof = CredentialProof::sign(&alice, &request.id, &request.subject_ref, &alice_id);
//! let request = service.submit_signature(&request.id, &alice_id, &proof)?;
//! assert_eq!(request.status.as_str(), "PARTIAL");
//! ```

pub mod audit;
pub mod authority;
pub mod clock;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod emergency;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod quorum;
pub mod request;
pub mod store;

// Re-exports for convenience
pub use audit::{
    verify_chain, AuditAction, AuditEntry, AuditSink, ChainHead, ChainVerification,
    ChainVerifier, GENESIS_HASH,
};
pub use authority::{Authority, AuthorityRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CountersignConfig, LogFormat};
pub use credential::{
    CredentialAction, CredentialClass, CredentialProof, CredentialVerifier, Ed25519Verifier,
    MAX_CLOCK_SKEW_SECS,
};
pub use crypto::{PublicKey, Signature, SigningKey};
pub use emergency::{EmergencyLevel, EmergencyState, EMERGENCY_THRESHOLD_PERCENT};
pub use error::{Error, ErrorCode, Result};
pub use ledger::{SignatureLedger, SignatureRecord, SignatureSet};
pub use lifecycle::{AuthorizationService, IntegrityStatus, NewRequest, RequestView};
pub use quorum::{QuorumEvaluation, QuorumState};
pub use request::{
    ApprovalPolicy, AuthorityId, AuthorizationRequest, RequestFilter, RequestId, RequestKind,
    RequestStatus,
};
pub use store::{AuditFilter, MemoryStore, SqliteStore, Store};

/// Context string for Ed25519 signatures (prevents cross-protocol attacks).
///
/// All signatures are computed over: `SIGNATURE_CONTEXT || payload`
pub const SIGNATURE_CONTEXT: &[u8] = b"countersign-credential-v1";
