//! Property-based tests for the quorum and audit chain invariants.
//!
//! 1. Quorum monotonicity - adding a signature never lowers the state
//! 2. Emergency threshold - `max(1, floor(base * 67 / 100))` only at high severity
//! 3. Distinct counting - an authority counts once however often it signs
//! 4. Tamper evidence - any edit is reported at the edited sequence

use chrono::Utc;
use countersign::{
    audit::{AuditChain, AuditDraft},
    credential::SigningClaim,
    quorum, ApprovalPolicy, AuditAction, AuthorityId, CredentialAction, CredentialClass,
    CredentialProof, EmergencyLevel, EmergencyState, QuorumState, RequestId, SignatureRecord,
    SignatureSet, SigningKey,
};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn arb_level() -> impl Strategy<Value = EmergencyLevel> {
    prop_oneof![
        Just(EmergencyLevel::Peacetime),
        Just(EmergencyLevel::Elevated),
        Just(EmergencyLevel::NationalEmergency),
        Just(EmergencyLevel::War),
    ]
}

fn arb_emergency() -> impl Strategy<Value = EmergencyState> {
    (any::<bool>(), arb_level()).prop_map(|(active, level)| {
        if active {
            EmergencyState::activated(level, Utc::now(), AuthorityId::new("admin"))
        } else {
            EmergencyState {
                level,
                ..EmergencyState::inactive()
            }
        }
    })
}

fn pool(n: usize) -> Vec<AuthorityId> {
    (0..n).map(|i| AuthorityId::new(format!("authority-{}", i))).collect()
}

fn record(key: &SigningKey, request_id: &RequestId, authority: &AuthorityId) -> SignatureRecord {
    let proof = CredentialProof::create(
        key,
        CredentialClass::Standard,
        &SigningClaim {
            action: CredentialAction::Sign,
            request_id,
            subject_ref: "incident-1",
            authority_id: authority,
        },
        Utc::now(),
    );
    SignatureRecord {
        request_id: request_id.clone(),
        authority_id: authority.clone(),
        key_fingerprint: key.public_key().fingerprint(),
        signed_at: proof.signed_at,
        recorded_at: Utc::now(),
        proof,
    }
}

// ============================================================================
// Invariant 1: Quorum monotonicity
// ============================================================================

proptest! {
    /// Signing in any order only moves the state forward.
    #[test]
    fn quorum_state_never_regresses(
        size in 1usize..8,
        threshold_seed in any::<u32>(),
        order in Just((0..8).collect::<Vec<usize>>()).prop_shuffle(),
        emergency in arb_emergency(),
    ) {
        let signers = pool(size);
        let threshold = threshold_seed % size as u32 + 1;
        let policy = ApprovalPolicy::new(threshold, signers.clone());
        let key = SigningKey::generate();
        let request_id = RequestId::generate();

        let mut set = SignatureSet::new();
        let mut previous = quorum::evaluate(&policy, &set, &emergency).unwrap();
        prop_assert_eq!(previous.state, QuorumState::Pending);

        for index in order.into_iter().filter(|i| *i < size) {
            set.insert(record(&key, &request_id, &signers[index]));
            let next = quorum::evaluate(&policy, &set, &emergency).unwrap();
            prop_assert!(next.state >= previous.state);
            prop_assert!(next.signature_count >= previous.signature_count);
            previous = next;
        }
        // Everyone signed: always enough.
        prop_assert_eq!(previous.state, QuorumState::Authorized);
    }
}

// ============================================================================
// Invariant 2: Emergency threshold
// ============================================================================

proptest! {
    #[test]
    fn emergency_threshold_formula(base in 1u32..10_000, emergency in arb_emergency()) {
        let effective = emergency.effective_threshold(base);
        if emergency.active && emergency.level.is_high_severity() {
            prop_assert_eq!(effective, (base * 67 / 100).max(1));
            prop_assert!(effective >= 1);
            prop_assert!(effective <= base);
        } else {
            prop_assert_eq!(effective, base);
        }
    }

    #[test]
    fn relaxed_threshold_is_never_zero(base in 1u32..4) {
        let war =
            EmergencyState::activated(EmergencyLevel::War, Utc::now(), AuthorityId::new("admin"));
        prop_assert!(war.effective_threshold(base) >= 1);
    }
}

// ============================================================================
// Invariant 3: Distinct counting
// ============================================================================

proptest! {
    #[test]
    fn repeated_signatures_count_once(signs in prop::collection::vec(0usize..4, 1..20)) {
        let signers = pool(4);
        let key = SigningKey::generate();
        let request_id = RequestId::generate();

        let mut set = SignatureSet::new();
        for index in &signs {
            set.insert(record(&key, &request_id, &signers[*index]));
        }

        let distinct: std::collections::BTreeSet<_> = signs.iter().collect();
        prop_assert_eq!(set.len(), distinct.len());
        prop_assert_eq!(set.distinct_signers().len(), distinct.len());
    }
}

// ============================================================================
// Invariant 4: Tamper evidence
// ============================================================================

fn build_chain(n: usize) -> Vec<countersign::AuditEntry> {
    let chain = AuditChain::new();
    (0..n)
        .map(|i| {
            let actor = format!("authority-{}", i % 3);
            let draft =
                AuditDraft::new(AuditAction::Sign, actor, "incident-1").meta("index", i as u64);
            chain.append(draft, Utc::now(), |_| Ok(())).unwrap()
        })
        .collect()
}

proptest! {
    #[test]
    fn untouched_chain_verifies(n in 0usize..40) {
        let entries = build_chain(n);
        let verification = countersign::verify_chain(&entries);
        prop_assert!(verification.valid);
        prop_assert_eq!(verification.entries_checked, n as u64);
    }

    #[test]
    fn edited_entry_is_detected(n in 1usize..40, seed in any::<usize>(), field in 0u8..4) {
        let mut entries = build_chain(n);
        let k = seed % n;
        match field {
            0 => entries[k].actor.push('x'),
            1 => entries[k].subject_ref = "incident-2".into(),
            2 => {
                entries[k].metadata.insert("index".into(), serde_json::json!(9999));
            }
            _ => entries[k].timestamp += chrono::Duration::milliseconds(1),
        }

        let verification = countersign::verify_chain(&entries);
        prop_assert!(!verification.valid);
        prop_assert_eq!(verification.first_invalid_sequence, Some(k as u64 + 1));
    }

    #[test]
    fn removed_entry_is_detected(n in 2usize..40, seed in any::<usize>()) {
        let mut entries = build_chain(n);
        let k = seed % (n - 1);
        entries.remove(k);

        let verification = countersign::verify_chain(&entries);
        prop_assert!(!verification.valid);
        prop_assert_eq!(verification.first_invalid_sequence, Some(k as u64 + 1));
    }
}
