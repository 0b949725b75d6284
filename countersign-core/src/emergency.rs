//! Process-wide emergency mode.
//!
//! The state is owned by the lifecycle service and handed to the quorum
//! evaluator by value on every evaluation, so evaluation stays pure.

use crate::error::{Error, Result};
use crate::request::AuthorityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Percentage of the base threshold that remains required during a
/// high-severity emergency (`floor(threshold * 0.67)`, at least 1).
pub const EMERGENCY_THRESHOLD_PERCENT: u32 = 67;

/// Severity of the current emergency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyLevel {
    Peacetime,
    Elevated,
    NationalEmergency,
    War,
}

impl EmergencyLevel {
    /// Levels at which the quorum threshold is relaxed.
    pub fn is_high_severity(self) -> bool {
        matches!(self, Self::NationalEmergency | Self::War)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Peacetime => "peacetime",
            Self::Elevated => "elevated",
            Self::NationalEmergency => "national_emergency",
            Self::War => "war",
        }
    }
}

impl fmt::Display for EmergencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmergencyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "peacetime" => Ok(Self::Peacetime),
            "elevated" => Ok(Self::Elevated),
            "national_emergency" => Ok(Self::NationalEmergency),
            "war" => Ok(Self::War),
            other => Err(Error::SerializationError(format!(
                "unknown emergency level '{}'",
                other
            ))),
        }
    }
}

/// Snapshot of the emergency flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyState {
    pub active: bool,
    pub level: EmergencyLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_by: Option<AuthorityId>,
}

impl Default for EmergencyState {
    fn default() -> Self {
        Self::inactive()
    }
}

impl EmergencyState {
    /// Normal operations.
    pub fn inactive() -> Self {
        Self {
            active: false,
            level: EmergencyLevel::Peacetime,
            activated_at: None,
            activated_by: None,
        }
    }

    /// An active emergency at `level`.
    pub fn activated(level: EmergencyLevel, at: DateTime<Utc>, by: AuthorityId) -> Self {
        Self {
            active: true,
            level,
            activated_at: Some(at),
            activated_by: Some(by),
        }
    }

    /// True when the quorum threshold should be relaxed.
    pub fn relaxes_threshold(&self) -> bool {
        self.active && self.level.is_high_severity()
    }

    /// Apply the emergency reduction to a base threshold.
    pub fn effective_threshold(&self, base: u32) -> u32 {
        if self.relaxes_threshold() {
            // Integer form of floor(base * 0.67); avoids float rounding.
            (base.saturating_mul(EMERGENCY_THRESHOLD_PERCENT) / 100).max(1)
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(level: EmergencyLevel) -> EmergencyState {
        EmergencyState::activated(level, Utc::now(), AuthorityId::new("admin"))
    }

    #[test]
    fn test_inactive_keeps_threshold() {
        assert_eq!(EmergencyState::inactive().effective_threshold(3), 3);
    }

    #[test]
    fn test_war_relaxes_threshold() {
        let state = active(EmergencyLevel::War);
        assert_eq!(state.effective_threshold(3), 2);
        assert_eq!(state.effective_threshold(1), 1);
        assert_eq!(state.effective_threshold(2), 1);
        assert_eq!(state.effective_threshold(10), 6);
        assert_eq!(state.effective_threshold(100), 67);
    }

    #[test]
    fn test_elevated_does_not_relax() {
        let state = active(EmergencyLevel::Elevated);
        assert!(!state.relaxes_threshold());
        assert_eq!(state.effective_threshold(3), 3);
    }

    #[test]
    fn test_level_wire_names() {
        assert_eq!(
            serde_json::to_string(&EmergencyLevel::NationalEmergency).unwrap(),
            "\"national_emergency\""
        );
        assert_eq!("war".parse::<EmergencyLevel>().unwrap(), EmergencyLevel::War);
        assert!("martial".parse::<EmergencyLevel>().is_err());
    }
}
