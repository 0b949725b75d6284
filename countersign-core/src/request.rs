//! Authorization requests and their approval policies.
//!
//! An [`AuthorizationRequest`] is the unit a human quorum signs off on. It
//! covers both remediation *packets* and operational *decisions*; the two
//! share one approval model and are told apart by [`RequestKind`].

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix for request identifiers.
pub const REQUEST_ID_PREFIX: &str = "req_";

/// Identifier of an authority (human or system principal).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorityId(String);

impl AuthorityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AuthorityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier of an authorization request.
///
/// Generated IDs are UUIDv7 so they sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        RequestId::parse(s).map_err(serde::de::Error::custom)
    }
}

impl RequestId {
    /// Generate a new time-ordered request ID.
    pub fn generate() -> Self {
        Self(format!("{}{}", REQUEST_ID_PREFIX, Uuid::now_v7().simple()))
    }

    /// Parse a request ID, rejecting strings without the `req_` prefix.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if !s.starts_with(REQUEST_ID_PREFIX) || s.len() == REQUEST_ID_PREFIX.len() {
            return Err(Error::UnknownRequest(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What is being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A pre-computed remediation packet proposed by the incident engine.
    Packet,
    /// An operational decision raised by an operator.
    Decision,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Packet => "packet",
            Self::Decision => "decision",
        }
    }
}

impl FromStr for RequestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "packet" => Ok(Self::Packet),
            "decision" => Ok(Self::Decision),
            other => Err(Error::SerializationError(format!(
                "unknown request kind '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Partial,
    Authorized,
    Rejected,
    Expired,
}

impl RequestStatus {
    /// AUTHORIZED, REJECTED and EXPIRED accept no further signatures.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Authorized | Self::Rejected | Self::Expired)
    }

    /// Position along `PENDING < PARTIAL < AUTHORIZED`.
    ///
    /// Returns `None` for the terminal overrides, which sit outside that order.
    pub fn progress(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Partial => Some(1),
            Self::Authorized => Some(2),
            Self::Rejected | Self::Expired => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Partial => "PARTIAL",
            Self::Authorized => "AUTHORIZED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "PARTIAL" => Ok(Self::Partial),
            "AUTHORIZED" => Ok(Self::Authorized),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(Error::SerializationError(format!(
                "unknown request status '{}'",
                other
            ))),
        }
    }
}

/// M-of-N approval policy supplied by the incident engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Authorities whose signature is mandatory regardless of the count.
    #[serde(default)]
    pub required_signers: BTreeSet<AuthorityId>,
    /// Number of distinct signatures needed outside an emergency.
    pub threshold: u32,
    /// Eligible signer pool.
    pub signers: BTreeSet<AuthorityId>,
}

impl ApprovalPolicy {
    /// Policy over `signers` needing `threshold` of them, no mandatory signers.
    pub fn new<I, A>(threshold: u32, signers: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AuthorityId>,
    {
        Self {
            required_signers: BTreeSet::new(),
            threshold,
            signers: signers.into_iter().map(Into::into).collect(),
        }
    }

    /// Mark authorities as mandatory signers.
    pub fn with_required<I, A>(mut self, required: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AuthorityId>,
    {
        self.required_signers = required.into_iter().map(Into::into).collect();
        self
    }

    /// Check the policy is well formed before a request is created.
    pub fn validate(&self) -> Result<()> {
        if self.threshold < 1 {
            return Err(Error::InvalidPolicy("threshold must be at least 1".into()));
        }
        if self.threshold as usize > self.signers.len() {
            return Err(Error::InvalidPolicy(format!(
                "threshold {} exceeds {} eligible signers",
                self.threshold,
                self.signers.len()
            )));
        }
        if let Some(outsider) = self
            .required_signers
            .iter()
            .find(|a| !self.signers.contains(*a))
        {
            return Err(Error::InvalidPolicy(format!(
                "required signer '{}' is not in the eligible pool",
                outsider
            )));
        }
        Ok(())
    }

    pub fn is_eligible(&self, authority: &AuthorityId) -> bool {
        self.signers.contains(authority)
    }
}

/// Who closed a request by rejection and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub authority_id: AuthorityId,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

/// Record of an emergency override authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideGrant {
    pub authority_id: AuthorityId,
    pub override_key_fingerprint: String,
    pub bypassed_threshold: u32,
    pub signatures_at_override: usize,
}

/// The unit being authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    /// Reference to the incident or action under review (opaque).
    pub subject_ref: String,
    pub policy: ApprovalPolicy,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Hash of the audit head when the request was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_chain_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(rename = "override", skip_serializing_if = "Option::is_none")]
    pub override_grant: Option<OverrideGrant>,
}

impl AuthorizationRequest {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True once the TTL has elapsed and the request never closed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && now > self.expires_at
    }
}

/// Filter for `list_requests`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestFilter {
    #[serde(default)]
    pub status: Option<RequestStatus>,
    #[serde(default)]
    pub kind: Option<RequestKind>,
    #[serde(default)]
    pub subject_ref: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RequestFilter {
    pub fn matches(&self, request: &AuthorizationRequest) -> bool {
        self.status.map_or(true, |s| s == request.status)
            && self.kind.map_or(true, |k| k == request.kind)
            && self
                .subject_ref
                .as_deref()
                .map_or(true, |s| s == request.subject_ref)
    }
}
