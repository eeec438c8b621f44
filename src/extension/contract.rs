//! Capability validation
//!
//! An evaluated extension script describes the object it produced as a
//! [`CapabilityReport`]: whether an object was produced at all, its
//! identifying strings, and the `typeof` of every contract member. The
//! report is checked here before anything is registered or called.

use crate::core::error::{Result, TsukiyoError};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Members an extension must expose as functions
pub const REQUIRED_MEMBERS: [&str; 6] = [
    "search",
    "explorer",
    "informations",
    "chapters",
    "reader",
    "isRateLimited",
];

/// Version recorded when a script declares none
pub const DEFAULT_VERSION: &str = "1.0.0";

/// What the sandbox saw after evaluating a script
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CapabilityReport {
    /// Whether evaluation produced an object
    pub present: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// `typeof` of each contract member
    #[serde(default)]
    pub members: BTreeMap<String, String>,
}

impl CapabilityReport {
    /// Contract members that are absent or not functions
    pub fn missing_members(&self) -> Vec<&'static str> {
        REQUIRED_MEMBERS
            .iter()
            .copied()
            .filter(|member| self.members.get(*member).map(String::as_str) != Some("function"))
            .collect()
    }
}

/// Identity of a validated extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityManifest {
    pub id: String,
    pub name: String,
    pub version: String,
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap_or_else(|e| panic!("invalid id pattern: {e}"))
    })
}

/// Check a report against the contract
///
/// Fails with `InvalidExtensionFormat` naming every problem found, so a
/// broken script is reported in one go.
pub fn validate(report: &CapabilityReport) -> Result<CapabilityManifest> {
    if !report.present {
        return Err(TsukiyoError::InvalidExtensionFormat(
            "script did not produce an extension object".to_string(),
        ));
    }

    let mut problems = Vec::new();

    let missing = report.missing_members();
    if !missing.is_empty() {
        problems.push(format!("missing functions: {}", missing.join(", ")));
    }

    let id = report.id.as_deref().map(str::trim).unwrap_or_default();
    if id.is_empty() {
        problems.push("missing string 'id'".to_string());
    } else if !id_pattern().is_match(id) {
        problems.push(format!("invalid id '{}'", id));
    }

    let name = report.name.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() {
        problems.push("missing string 'name'".to_string());
    }

    if !problems.is_empty() {
        return Err(TsukiyoError::InvalidExtensionFormat(problems.join("; ")));
    }

    Ok(CapabilityManifest {
        id: id.to_string(),
        name: name.to_string(),
        version: normalize_version(report.version.as_deref()),
    })
}

/// Canonical semver form when the declared version parses, the trimmed
/// text otherwise, `1.0.0` when absent.
pub fn normalize_version(declared: Option<&str>) -> String {
    let declared = match declared.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return DEFAULT_VERSION.to_string(),
    };

    let candidate = declared.trim_start_matches('v');
    match semver::Version::parse(candidate) {
        Ok(version) => version.to_string(),
        Err(_) => {
            tracing::warn!(version = %declared, "Extension version is not semver, keeping as declared");
            declared.to_string()
        }
    }
}
