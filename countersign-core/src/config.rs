//! Configuration file parser.
//!
//! # Configuration File Format
//!
//! ```yaml
//! version: "1"
//!
//! settings:
//!   request_ttl_secs: 3600
//!   sweep_interval_secs: 30
//!   database_path: "/var/lib/countersign/countersign.db"
//!   bind_addr: "127.0.0.1:8080"
//!   log_format: json
//!   audit_log_path: "/var/log/countersign/audit.jsonl"
//!
//! authorities:
//!   - id: grid-ops-lead
//!     display_name: "Grid Operations Lead"
//!     public_key: "f32e74b5..."
//!     veto: true
//!   - id: regional-director
//!     public_key: "9a0c11d2..."
//!     override_key: "77b0e3aa..."
//! ```
//!
//! Omitting `database_path` runs the service on an in-memory store. Keys are
//! hex, or an SPKI PEM block.

use crate::authority::{Authority, AuthorityRegistry};
use crate::crypto::PublicKey;
use crate::error::{Error, Result};
use crate::lifecycle::DEFAULT_REQUEST_TTL_SECS;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Configuration parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountersignConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub authorities: Vec<AuthorityConfig>,
}

fn default_version() -> String {
    "1".into()
}

/// Service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Time-to-live of open requests (seconds)
    #[serde(default = "default_request_ttl")]
    pub request_ttl_secs: u64,
    /// Interval of the background expiry sweep (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// SQLite database file; in-memory when absent
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Copy of every committed audit entry as JSON lines
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

fn default_request_ttl() -> u64 {
    DEFAULT_REQUEST_TTL_SECS
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".into()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_ttl_secs: default_request_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            database_path: None,
            bind_addr: default_bind_addr(),
            log_format: LogFormat::default(),
            audit_log_path: None,
        }
    }
}

/// Log output format for the binaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// One registered authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Ed25519 public key (hex or PEM)
    pub public_key: String,
    #[serde(default)]
    pub veto: bool,
    /// Override-class public key (hex or PEM)
    #[serde(default)]
    pub override_key: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

fn parse_key(key: &str) -> Result<PublicKey> {
    let key = key.trim();
    if key.starts_with("-----BEGIN") {
        PublicKey::from_pem(key)
    } else {
        PublicKey::from_hex(key)
    }
}

impl AuthorityConfig {
    fn to_authority(&self) -> Result<Authority> {
        let mut authority = Authority::new(self.id.as_str(), parse_key(&self.public_key)?);
        if let Some(name) = &self.display_name {
            authority = authority.with_display_name(name.clone());
        }
        if self.veto {
            authority = authority.with_veto();
        }
        if let Some(key) = &self.override_key {
            authority = authority.with_override_key(parse_key(key)?);
        }
        authority.active = self.active;
        Ok(authority)
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigValidationError {
    /// Location in config (e.g., "authorities[0].public_key")
    pub location: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

impl CountersignConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::ConfigError(format!("YAML parse error: {}", e)))
    }

    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Validate the configuration, collecting every problem.
    pub fn validate(&self) -> std::result::Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();
        let mut push = |location: String, message: String| {
            errors.push(ConfigValidationError { location, message })
        };

        if self.version != "1" {
            push("version".into(), format!("unsupported version '{}'", self.version));
        }
        if self.settings.request_ttl_secs == 0 {
            push(
                "settings.request_ttl_secs".into(),
                "must be greater than zero".into(),
            );
        }
        if self.settings.sweep_interval_secs == 0 {
            push(
                "settings.sweep_interval_secs".into(),
                "must be greater than zero".into(),
            );
        }
        if self.settings.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            push(
                "settings.bind_addr".into(),
                format!("'{}' is not a socket address", self.settings.bind_addr),
            );
        }

        let mut seen = HashSet::new();
        for (i, authority) in self.authorities.iter().enumerate() {
            if authority.id.trim().is_empty() {
                push(format!("authorities[{}].id", i), "must not be empty".into());
            }
            if !seen.insert(authority.id.as_str()) {
                push(
                    format!("authorities[{}].id", i),
                    format!("duplicate authority '{}'", authority.id),
                );
            }
            let standard = match parse_key(&authority.public_key) {
                Ok(key) => Some(key),
                Err(e) => {
                    push(format!("authorities[{}].public_key", i), e.to_string());
                    None
                }
            };
            if let Some(key) = &authority.override_key {
                match parse_key(key) {
                    Err(e) => push(format!("authorities[{}].override_key", i), e.to_string()),
                    Ok(k) if Some(&k) == standard.as_ref() => push(
                        format!("authorities[{}].override_key", i),
                        "must differ from the standard key".into(),
                    ),
                    Ok(_) => {}
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and build the authority registry.
    pub fn registry(&self) -> Result<AuthorityRegistry> {
        self.validate().map_err(|errors| {
            Error::ConfigError(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        self.authorities
            .iter()
            .map(AuthorityConfig::to_authority)
            .collect()
    }

    pub fn request_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settings.request_ttl_secs.min(i64::MAX as u64) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKey;
    use crate::request::AuthorityId;

    fn sample(a: &str, b: &str) -> String {
        format!(
            r#"
version: "1"
settings:
  request_ttl_secs: 600
  log_format: json
authorities:
  - id: grid-ops-lead
    public_key: "{a}"
    veto: true
  - id: regional-director
    display_name: Regional Director
    public_key: "{b}"
"#
        )
    }

    #[test]
    fn test_parse_and_build_registry() {
        let a = SigningKey::generate().public_key().to_hex();
        let b = SigningKey::generate().public_key().to_hex();
        let config = CountersignConfig::from_yaml(&sample(&a, &b)).unwrap();
        assert_eq!(config.settings.request_ttl_secs, 600);
        assert_eq!(config.settings.sweep_interval_secs, 30);
        assert_eq!(config.settings.log_format, LogFormat::Json);
        assert!(config.settings.database_path.is_none());

        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.resolve(&AuthorityId::new("grid-ops-lead")).unwrap().veto);
    }

    #[test]
    fn test_validation_collects_errors() {
        let a = SigningKey::generate().public_key().to_hex();
        let yaml = format!(
            r#"
settings:
  request_ttl_secs: 0
authorities:
  - id: dup
    public_key: "{a}"
  - id: dup
    public_key: "not-hex"
"#
        );
        let config = CountersignConfig::from_yaml(&yaml).unwrap();
        let errors = config.validate().unwrap_err();
        let locations: Vec<_> = errors.iter().map(|e| e.location.as_str()).collect();
        assert!(locations.contains(&"settings.request_ttl_secs"));
        assert!(locations.contains(&"authorities[1].id"));
        assert!(locations.contains(&"authorities[1].public_key"));
        assert!(matches!(config.registry(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            CountersignConfig::from_file("/nonexistent/countersign.yaml"),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_pem_keys_are_accepted() {
        let key = SigningKey::generate();
        let pem = key.public_key().to_pem().unwrap();
        let indented = pem.lines().map(|l| format!("      {}\n", l)).collect::<String>();
        let yaml = format!(
            "authorities:\n  - id: field-supervisor\n    public_key: |\n{}",
            indented
        );
        let config = CountersignConfig::from_yaml(&yaml).unwrap();
        let registry = config.registry().unwrap();
        let authority = registry.resolve(&AuthorityId::new("field-supervisor")).unwrap();
        assert_eq!(authority.public_key, key.public_key());
    }

    #[test]
    fn test_override_key_must_differ() {
        let key = SigningKey::generate().public_key();
        let yaml = format!(
            "authorities:\n  - id: director\n    public_key: \"{}\"\n    override_key: \"{}\"\n",
            key.to_hex(),
            key.to_pem().unwrap().replace('\n', "\\n")
        );
        let errors = CountersignConfig::from_yaml(&yaml).unwrap().validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].location, "authorities[0].override_key");
    }
}
