//! Error types for Countersign.
//!
//! Every failure is returned as a typed [`Error`]. Each variant maps to a
//! canonical [`ErrorCode`] so the HTTP surface and the CLI report the same
//! machine-readable name for the same condition.

use thiserror::Error;

/// Result type alias for Countersign operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical error codes.
///
/// Code ranges:
/// - 1000-1099: Request errors
/// - 1100-1199: Signer and credential errors
/// - 1200-1299: Policy errors
/// - 1300-1399: Audit chain errors
/// - 1900-1999: Infrastructure errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Request errors (1000-1099)
    UnknownRequest = 1000,
    AlreadyTerminal = 1001,

    // Signer and credential errors (1100-1199)
    UnauthorizedSigner = 1100,
    InvalidCredential = 1101,
    UnknownAuthority = 1102,

    // Policy errors (1200-1299)
    InvalidPolicy = 1200,
    UnsatisfiablePolicy = 1201,

    // Audit chain errors (1300-1399)
    ChainCorruption = 1300,

    // Infrastructure errors (1900-1999)
    Storage = 1900,
    Serialization = 1901,
    Configuration = 1902,
    Crypto = 1903,
}

impl ErrorCode {
    /// Get the numeric code value.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Get machine-readable name (kebab-case).
    pub fn name(self) -> &'static str {
        match self {
            Self::UnknownRequest => "unknown-request",
            Self::AlreadyTerminal => "already-terminal",
            Self::UnauthorizedSigner => "unauthorized-signer",
            Self::InvalidCredential => "invalid-credential",
            Self::UnknownAuthority => "unknown-authority",
            Self::InvalidPolicy => "invalid-policy",
            Self::UnsatisfiablePolicy => "unsatisfiable-policy",
            Self::ChainCorruption => "chain-corruption",
            Self::Storage => "storage-error",
            Self::Serialization => "serialization-error",
            Self::Configuration => "configuration-error",
            Self::Crypto => "crypto-error",
        }
    }

    /// Get HTTP status code for this error.
    pub fn http_status(self) -> u16 {
        match self {
            Self::UnknownRequest => 404,
            Self::AlreadyTerminal => 409,
            Self::UnauthorizedSigner => 403,
            Self::InvalidCredential => 401,
            Self::UnknownAuthority => 403,
            Self::InvalidPolicy => 400,
            Self::UnsatisfiablePolicy => 422,
            // Reads keep working; writes are refused until acknowledged.
            Self::ChainCorruption => 503,
            Self::Configuration => 400,
            Self::Serialization => 400,
            Self::Storage | Self::Crypto => 500,
        }
    }

    /// Get human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::UnknownRequest => "Authorization request does not exist or is closed",
            Self::AlreadyTerminal => "Authorization request is already in a terminal state",
            Self::UnauthorizedSigner => "Authority is not eligible for this request",
            Self::InvalidCredential => "Credential proof could not be verified",
            Self::UnknownAuthority => "Authority is not registered",
            Self::InvalidPolicy => "Approval policy is malformed",
            Self::UnsatisfiablePolicy => "Approval policy can never be satisfied",
            Self::ChainCorruption => "Audit chain integrity check failed",
            Self::Storage => "Storage layer failure",
            Self::Serialization => "Serialization failure",
            Self::Configuration => "Configuration is invalid",
            Self::Crypto => "Cryptographic operation failed",
        }
    }

    /// True for errors the caller can fix by retrying with corrected input.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::ChainCorruption | Self::Storage)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Errors that can occur in Countersign operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Request does not exist, or is terminal at the signature ledger boundary.
    #[error("unknown request: {0}")]
    UnknownRequest(String),

    /// Request already reached AUTHORIZED, REJECTED or EXPIRED.
    #[error("request {request_id} is already terminal ({status})")]
    AlreadyTerminal { request_id: String, status: String },

    // =========================================================================
    // Signer & Credential Errors
    // =========================================================================
    /// Authority is not in the request's eligible signer pool, or lacks the
    /// right required for the attempted action.
    #[error("authority '{authority}' is not authorized for request {request_id}: {reason}")]
    UnauthorizedSigner {
        authority: String,
        request_id: String,
        reason: String,
    },

    /// Credential proof failed verification.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Authority is not present (or no longer active) in the registry.
    #[error("unknown authority: {0}")]
    UnknownAuthority(String),

    // =========================================================================
    // Policy Errors
    // =========================================================================
    /// Policy rejected at creation time.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// Eligible signer pool cannot reach the threshold.
    #[error("unsatisfiable policy: {signers} eligible signers cannot meet threshold {threshold}")]
    UnsatisfiablePolicy { signers: usize, threshold: u32 },

    // =========================================================================
    // Audit Chain Errors
    // =========================================================================
    /// Audit chain verification failed at the given sequence number.
    #[error("audit chain corrupted at sequence {sequence}: {details}")]
    ChainCorruption { sequence: u64, details: String },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Storage backend failure.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Cryptographic operation failed (malformed key material, bad PEM, ...).
    #[error("cryptographic error: {0}")]
    CryptoError(String),
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::CryptoError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StorageError(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::CryptoError(format!("invalid hex: {}", e))
    }
}

impl Error {
    /// Map this error to a canonical error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownRequest(_) => ErrorCode::UnknownRequest,
            Self::AlreadyTerminal { .. } => ErrorCode::AlreadyTerminal,
            Self::UnauthorizedSigner { .. } => ErrorCode::UnauthorizedSigner,
            Self::InvalidCredential(_) => ErrorCode::InvalidCredential,
            Self::UnknownAuthority(_) => ErrorCode::UnknownAuthority,
            Self::InvalidPolicy(_) => ErrorCode::InvalidPolicy,
            Self::UnsatisfiablePolicy { .. } => ErrorCode::UnsatisfiablePolicy,
            Self::ChainCorruption { .. } => ErrorCode::ChainCorruption,
            Self::StorageError(_) => ErrorCode::Storage,
            Self::SerializationError(_) => ErrorCode::Serialization,
            Self::ConfigError(_) => ErrorCode::Configuration,
            Self::CryptoError(_) => ErrorCode::Crypto,
        }
    }

    /// Build a storage error from a poisoned lock.
    pub(crate) fn poisoned(what: &str) -> Self {
        Error::StorageError(format!("{} lock poisoned", what))
    }
}
