//! Quorum evaluator.
//!
//! [`evaluate`] is a pure function from `(policy, signatures, emergency)` to a
//! [`QuorumEvaluation`]. It performs no I/O and never looks at the clock; the
//! lifecycle service owns expiry and explicit rejection, which sit outside
//! the threshold math.
//!
//! # Rules
//!
//! ```text
//! effective = threshold                                  (normal operations)
//! effective = max(1, floor(threshold * 0.67))            (national_emergency / war)
//!
//! PENDING     no signatures
//! PARTIAL     some signatures, effective threshold or a required signer missing
//! AUTHORIZED  signature count AND distinct signers >= effective,
//!             every required signer present
//! ```

use crate::emergency::{EmergencyLevel, EmergencyState};
use crate::error::{Error, Result};
use crate::ledger::SignatureSet;
use crate::request::{ApprovalPolicy, AuthorityId, RequestStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// State reachable from threshold math alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuorumState {
    Pending,
    Partial,
    Authorized,
}

impl QuorumState {
    pub fn status(self) -> RequestStatus {
        match self {
            Self::Pending => RequestStatus::Pending,
            Self::Partial => RequestStatus::Partial,
            Self::Authorized => RequestStatus::Authorized,
        }
    }
}

/// Outcome of a quorum evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumEvaluation {
    pub state: QuorumState,
    pub base_threshold: u32,
    pub effective_threshold: u32,
    /// Signatures counted toward the threshold.
    pub signature_count: usize,
    /// Distinct eligible authorities among those signatures.
    pub distinct_signers: usize,
    /// Required signers that have not yet signed.
    pub missing_required: BTreeSet<AuthorityId>,
    /// Set when an emergency relaxed the threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relaxed_by: Option<EmergencyLevel>,
    /// Human-readable explanation, recorded in the audit trail.
    pub rationale: String,
}

impl QuorumEvaluation {
    pub fn is_authorized(&self) -> bool {
        self.state == QuorumState::Authorized
    }
}

/// Evaluate a signature set against a policy under the given emergency state.
///
/// # Errors
///
/// Returns `UnsatisfiablePolicy` if the eligible pool is smaller than the
/// base threshold, and `InvalidPolicy` for a zero threshold.
pub fn evaluate(
    policy: &ApprovalPolicy,
    signatures: &SignatureSet,
    emergency: &EmergencyState,
) -> Result<QuorumEvaluation> {
    if policy.threshold == 0 {
        return Err(Error::InvalidPolicy("threshold must be at least 1".into()));
    }
    if policy.signers.len() < policy.threshold as usize {
        return Err(Error::UnsatisfiablePolicy {
            signers: policy.signers.len(),
            threshold: policy.threshold,
        });
    }

    let effective = emergency.effective_threshold(policy.threshold);
    let relaxed_by = emergency.relaxes_threshold().then_some(emergency.level);

    // Only eligible signers count, however the set was assembled.
    let signature_count = signatures
        .iter()
        .filter(|r| policy.is_eligible(&r.authority_id))
        .count();
    let signed: BTreeSet<&AuthorityId> = signatures
        .distinct_signers()
        .into_iter()
        .filter(|a| policy.is_eligible(a))
        .collect();
    let distinct_signers = signed.len();

    let missing_required: BTreeSet<AuthorityId> = policy
        .required_signers
        .iter()
        .filter(|a| !signed.contains(a))
        .cloned()
        .collect();

    let threshold_met =
        signature_count >= effective as usize && distinct_signers >= effective as usize;

    let state = if signature_count == 0 {
        QuorumState::Pending
    } else if threshold_met && missing_required.is_empty() {
        QuorumState::Authorized
    } else {
        QuorumState::Partial
    };

    let rationale = rationale(
        state,
        policy.threshold,
        effective,
        distinct_signers,
        &missing_required,
        relaxed_by,
    );

    Ok(QuorumEvaluation {
        state,
        base_threshold: policy.threshold,
        effective_threshold: effective,
        signature_count,
        distinct_signers,
        missing_required,
        relaxed_by,
        rationale,
    })
}

fn rationale(
    state: QuorumState,
    base: u32,
    effective: u32,
    distinct: usize,
    missing: &BTreeSet<AuthorityId>,
    relaxed_by: Option<EmergencyLevel>,
) -> String {
    let mut text = format!("{} of {} distinct signatures", distinct, effective);
    if let Some(level) = relaxed_by {
        text.push_str(&format!(
            "; threshold relaxed from {} to {} under {} emergency",
            base, effective, level
        ));
    }
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(AuthorityId::as_str).collect();
        text.push_str(&format!("; awaiting required signers: {}", names.join(", ")));
    }
    match state {
        QuorumState::Pending => text.push_str("; no signatures yet"),
        QuorumState::Partial => {}
        QuorumState::Authorized => text.push_str("; quorum reached"),
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialClass, CredentialProof};
    use crate::crypto::Signature;
    use crate::ledger::SignatureRecord;
    use crate::request::RequestId;
    use chrono::Utc;

    fn set(names: &[&str]) -> SignatureSet {
        let request_id = RequestId::generate();
        names
            .iter()
            .map(|n| SignatureRecord {
                request_id: request_id.clone(),
                authority_id: AuthorityId::new(*n),
                proof: CredentialProof {
                    class: CredentialClass::Standard,
                    signature: Signature::from_bytes(&[0u8; 64]),
                    signed_at: Utc::now(),
                },
                key_fingerprint: "00".repeat(8),
                signed_at: Utc::now(),
                recorded_at: Utc::now(),
            })
            .collect()
    }

    fn war() -> EmergencyState {
        EmergencyState::activated(EmergencyLevel::War, Utc::now(), AuthorityId::new("admin"))
    }

    #[test]
    fn test_pending_without_signatures() {
        let policy = ApprovalPolicy::new(3, ["A", "B", "C"]);
        let eval = evaluate(&policy, &set(&[]), &EmergencyState::inactive()).unwrap();
        assert_eq!(eval.state, QuorumState::Pending);
        assert_eq!(eval.effective_threshold, 3);
    }

    #[test]
    fn test_normal_operations_need_full_threshold() {
        let policy = ApprovalPolicy::new(3, ["A", "B", "C"]);
        let normal = EmergencyState::inactive();
        assert_eq!(
            evaluate(&policy, &set(&["A", "B"]), &normal).unwrap().state,
            QuorumState::Partial
        );
        assert_eq!(
            evaluate(&policy, &set(&["A", "B", "C"]), &normal).unwrap().state,
            QuorumState::Authorized
        );
    }

    #[test]
    fn test_war_relaxes_three_to_two() {
        let policy = ApprovalPolicy::new(3, ["A", "B", "C"]);
        let one = evaluate(&policy, &set(&["A"]), &war()).unwrap();
        assert_eq!(one.state, QuorumState::Partial);
        assert_eq!(one.effective_threshold, 2);

        let two = evaluate(&policy, &set(&["A", "B"]), &war()).unwrap();
        assert_eq!(two.state, QuorumState::Authorized);
        assert_eq!(two.relaxed_by, Some(EmergencyLevel::War));
        assert!(two.rationale.contains("relaxed from 3 to 2"));
    }

    #[test]
    fn test_elevated_does_not_relax() {
        let policy = ApprovalPolicy::new(3, ["A", "B", "C"]);
        let elevated = EmergencyState::activated(
            EmergencyLevel::Elevated,
            Utc::now(),
            AuthorityId::new("admin"),
        );
        let eval = evaluate(&policy, &set(&["A", "B"]), &elevated).unwrap();
        assert_eq!(eval.state, QuorumState::Partial);
        assert_eq!(eval.relaxed_by, None);
    }

    #[test]
    fn test_required_signer_dominates() {
        let policy = ApprovalPolicy::new(2, ["A", "B", "C"]).with_required(["C"]);
        let eval = evaluate(&policy, &set(&["A", "B"]), &EmergencyState::inactive()).unwrap();
        assert_eq!(eval.state, QuorumState::Partial);
        assert!(eval.missing_required.contains(&AuthorityId::new("C")));
        assert!(eval.rationale.contains("awaiting required signers: C"));

        let eval = evaluate(&policy, &set(&["A", "C"]), &EmergencyState::inactive()).unwrap();
        assert_eq!(eval.state, QuorumState::Authorized);
    }

    #[test]
    fn test_ineligible_signatures_do_not_count() {
        let policy = ApprovalPolicy::new(2, ["A", "B"]);
        let eval = evaluate(&policy, &set(&["A", "X"]), &EmergencyState::inactive()).unwrap();
        assert_eq!(eval.state, QuorumState::Partial);
        assert_eq!(eval.signature_count, 1);
    }

    #[test]
    fn test_shrunken_pool_is_unsatisfiable() {
        let mut policy = ApprovalPolicy::new(3, ["A", "B", "C"]);
        policy.signers.remove(&AuthorityId::new("C"));
        let err = evaluate(&policy, &set(&["A", "B"]), &war()).unwrap_err();
        assert_eq!(
            err,
            Error::UnsatisfiablePolicy {
                signers: 2,
                threshold: 3
            }
        );
    }
}
