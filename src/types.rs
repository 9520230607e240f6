//! Core types shared by every layer: server versions, fleet targets and the
//! client identity announced in greetings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Servers older than this speak the legacy 147-byte record dialect.
pub const LEGACY_CUTOFF: ServerVersion = ServerVersion::new(11, 10);

/// Version announced by this client unless a target hint overrides it.
pub const CLIENT_VERSION: ServerVersion = ServerVersion::new(11, 11);

/// A FlexNet version as carried on the wire: one byte each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerVersion {
    pub major: u8,
    pub minor: u8,
}

impl ServerVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// True for servers that predate the checked-frame vendor protocol.
    pub fn is_legacy(self) -> bool {
        self < LEGACY_CUTOFF
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ServerVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("bad version `{s}`, expected major.minor"));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for ServerVersion {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerVersion> for String {
    fn from(value: ServerVersion) -> Self {
        value.to_string()
    }
}

/// One license manager in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "TargetRepr")]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
    /// Version to announce in greetings to this server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager_hint: Option<ServerVersion>,
}

impl ServerTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            manager_hint: None,
        }
    }

    pub fn with_hint(mut self, hint: ServerVersion) -> Self {
        self.manager_hint = Some(hint);
        self
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// FlexNet's own `port@host` notation.
impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.port, self.host)
    }
}

impl FromStr for ServerTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, host) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| ConfigError::Target(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::Target(s.to_string()))?;
        if host.is_empty() || port == 0 {
            return Err(ConfigError::Target(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetRepr {
    Short(String),
    Full {
        host: String,
        port: u16,
        #[serde(default)]
        manager_hint: Option<ServerVersion>,
    },
}

impl TryFrom<TargetRepr> for ServerTarget {
    type Error = ConfigError;

    fn try_from(repr: TargetRepr) -> Result<Self, Self::Error> {
        match repr {
            TargetRepr::Short(s) => s.parse(),
            TargetRepr::Full {
                host,
                port,
                manager_hint,
            } => {
                if host.is_empty() || port == 0 {
                    return Err(ConfigError::Target(format!("{port}@{host}")));
                }
                Ok(Self {
                    host,
                    port,
                    manager_hint,
                })
            }
        }
    }
}

/// Who this client claims to be in greetings and manager commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub user: String,
    pub host: String,
    pub tty: String,
    pub pid: String,
    /// Platform string, e.g. `x64_lsb`.
    pub arch: String,
    pub version: ServerVersion,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            user: String::new(),
            host: "localhost".to_string(),
            tty: "/dev/pts/1".to_string(),
            pid: std::process::id().to_string(),
            arch: "x64_lsb".to_string(),
            version: CLIENT_VERSION,
        }
    }
}

impl ClientIdentity {
    /// Identity derived from the running process and its environment.
    pub fn from_env() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        let host = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            user,
            host,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering_and_legacy_cutoff() {
        assert!(ServerVersion::new(11, 9).is_legacy());
        assert!(ServerVersion::new(10, 20).is_legacy());
        assert!(!ServerVersion::new(11, 10).is_legacy());
        assert!(!ServerVersion::new(12, 0).is_legacy());
        assert_eq!("11.16".parse::<ServerVersion>().unwrap(), ServerVersion::new(11, 16));
        assert!("11".parse::<ServerVersion>().is_err());
    }

    #[test]
    fn test_target_port_at_host() {
        let target: ServerTarget = "27000@licsrv01".parse().unwrap();
        assert_eq!(target, ServerTarget::new("licsrv01", 27000));
        assert_eq!(target.to_string(), "27000@licsrv01");
        assert_eq!(target.socket_addr(), "licsrv01:27000");
        assert_eq!(ServerTarget::new("::1", 5).socket_addr(), "[::1]:5");

        assert!("licsrv01".parse::<ServerTarget>().is_err());
        assert!("0@licsrv01".parse::<ServerTarget>().is_err());
        assert!("27000@".parse::<ServerTarget>().is_err());
    }

    #[test]
    fn test_target_deserializes_both_forms() {
        let targets: Vec<ServerTarget> = serde_json::from_str(
            r#"["27000@a", {"host": "b", "port": 1055, "manager_hint": "11.9"}]"#,
        )
        .unwrap();
        assert_eq!(targets[0], ServerTarget::new("a", 27000));
        assert_eq!(
            targets[1],
            ServerTarget::new("b", 1055).with_hint(ServerVersion::new(11, 9))
        );
    }
}
