//! JSON fleet configuration.
//!
//! ```json
//! {
//!   "targets": ["27000@licsrv01", {"host": "licsrv02", "port": 1055, "manager_hint": "11.9"}],
//!   "queries": ["license_path", "vendor_list", "vendors"],
//!   "concurrency": 4,
//!   "retries": 1,
//!   "connect_timeout_ms": 3000,
//!   "io_timeout_ms": 10000,
//!   "identity": {"user": "monitor"}
//! }
//! ```
//!
//! Everything except `targets` is optional.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::fleet::{FleetOptions, QueryKind};
use crate::tcp::SessionConfig;
use crate::types::{ClientIdentity, ServerTarget, ServerVersion};

/// Overrides for the identity announced to servers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityOverrides {
    pub user: Option<String>,
    pub host: Option<String>,
    pub tty: Option<String>,
    pub arch: Option<String>,
    pub version: Option<ServerVersion>,
}

impl IdentityOverrides {
    fn apply(self, mut identity: ClientIdentity) -> ClientIdentity {
        if let Some(user) = self.user {
            identity.user = user;
        }
        if let Some(host) = self.host {
            identity.host = host;
        }
        if let Some(tty) = self.tty {
            identity.tty = tty;
        }
        if let Some(arch) = self.arch {
            identity.arch = arch;
        }
        if let Some(version) = self.version {
            identity.version = version;
        }
        identity
    }
}

fn default_queries() -> Vec<QueryKind> {
    QueryKind::ALL.to_vec()
}

fn default_concurrency() -> usize {
    8
}

fn default_retries() -> u32 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

fn default_follow() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    pub targets: Vec<ServerTarget>,
    #[serde(default = "default_queries")]
    pub queries: Vec<QueryKind>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_follow")]
    pub follow_manager_host: bool,
    #[serde(default)]
    pub identity: IdentityOverrides,
}

impl FleetConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("no targets".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.connect_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Options for [`crate::fleet::Fleet`], identity taken from the
    /// environment and then overridden.
    pub fn options(&self) -> FleetOptions {
        FleetOptions {
            max_concurrency: self.concurrency,
            retries: self.retries,
            session: SessionConfig {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                io_timeout: Duration::from_millis(self.io_timeout_ms),
            },
            identity: self.identity.clone().apply(ClientIdentity::from_env()),
            follow_manager_host: self.follow_manager_host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = FleetConfig::from_json(r#"{"targets": ["27000@licsrv01"]}"#).unwrap();
        assert_eq!(config.queries, QueryKind::ALL.to_vec());
        let options = config.options();
        assert_eq!(options.max_concurrency, 8);
        assert_eq!(options.retries, 1);
        assert_eq!(options.session, SessionConfig::default());
        assert!(options.follow_manager_host);
    }

    #[test]
    fn test_full_config() {
        let config = FleetConfig::from_json(
            r#"{
                "targets": ["27000@a", {"host": "b", "port": 1055, "manager_hint": "11.9"}],
                "queries": ["license_path"],
                "concurrency": 2,
                "retries": 0,
                "connect_timeout_ms": 250,
                "io_timeout_ms": 500,
                "follow_manager_host": false,
                "identity": {"user": "monitor", "version": "11.13"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.targets.len(), 2);
        let options = config.options();
        assert_eq!(options.session.io_timeout, Duration::from_millis(500));
        assert_eq!(options.identity.user, "monitor");
        assert_eq!(options.identity.version, ServerVersion::new(11, 13));
        assert!(!options.follow_manager_host);
    }

    #[test]
    fn test_rejects_bad_configs() {
        assert!(matches!(
            FleetConfig::from_json(r#"{"targets": []}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            FleetConfig::from_json(r#"{"targets": ["nope"]}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            FleetConfig::from_json(r#"{"targets": ["1@a"], "concurrency": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            FleetConfig::from_json(r#"{"targets": ["1@a"], "colour": "red"}"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = FleetConfig::load("/nonexistent/fleet.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
