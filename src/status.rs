//! Normalized, serializable view of what a fleet run learned.

use serde::Serialize;

use crate::error::{ErrorClass, SessionError, TargetError};
use crate::license_file::{License, LicenseFile};
use crate::message::{LicenseSet, LicenseStatus, VendorRedirect};
use crate::types::{ServerTarget, ServerVersion};

/// A failure kept inside an otherwise successful report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub class: ErrorClass,
    /// Session phase at the time of failure, when a session was involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
}

impl From<&SessionError> for Failure {
    fn from(err: &SessionError) -> Self {
        Self {
            class: err.class(),
            phase: Some(err.phase.to_string()),
            message: err.fault.to_string(),
        }
    }
}

impl From<&TargetError> for Failure {
    fn from(err: &TargetError) -> Self {
        match err {
            TargetError::Session(e) => e.into(),
            TargetError::Cancelled => Self {
                class: ErrorClass::Cancelled,
                phase: None,
                message: err.to_string(),
            },
        }
    }
}

/// One license with the status a vendor daemon reported for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LicenseReport {
    #[serde(flatten)]
    pub license: License,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LicenseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl LicenseReport {
    pub fn new(license: License) -> Self {
        Self {
            license,
            status: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LicenseSetReport {
    pub fid: String,
    pub signature: String,
    pub names: String,
    pub date1: String,
    pub date2: String,
    pub url: String,
    pub licenses: Vec<LicenseReport>,
}

impl LicenseSetReport {
    /// Report for `set`, its license text parsed into licenses.
    pub fn new(set: &LicenseSet) -> Self {
        Self {
            fid: set.fid.clone(),
            signature: set.signature.clone(),
            names: set.names.clone(),
            date1: set.date1.clone(),
            date2: set.date2.clone(),
            url: set.url.clone(),
            licenses: LicenseFile::parse(&set.license_text)
                .licenses
                .into_iter()
                .map(LicenseReport::new)
                .collect(),
        }
    }
}

/// What one vendor daemon reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VendorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<ServerVersion>,
    pub legacy: bool,
    pub features: Vec<String>,
    /// Licenses the daemon reports on its own.
    pub license_sets: Vec<LicenseSetReport>,
    /// Licenses for this vendor found in the manager's license file.
    pub licenses: Vec<LicenseReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VendorStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<VendorRedirect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<VendorDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl VendorStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: None,
            details: None,
            error: None,
        }
    }
}

/// Everything learned from one license manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub target: ServerTarget,
    /// Host the queries actually went to; differs from the target when the
    /// manager named another host in its greeting.
    pub connected_host: String,
    pub hostname: String,
    pub daemon: String,
    pub version: ServerVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_file_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_file: Option<LicenseFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vendors: Vec<VendorStatus>,
}

impl ServerStatus {
    pub fn vendor(&self, name: &str) -> Option<&VendorStatus> {
        self.vendors.iter().find(|v| v.name == name)
    }
}

/// One line of a fleet report.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    /// `port@host`.
    pub target: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Ok { status: ServerStatus },
    Error { error: Failure },
}
