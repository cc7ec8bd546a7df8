//! Extension descriptor and runtime state (spec §3.1-§3.3).

use std::collections::BTreeSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// This host's own version, checked against every descriptor's
/// `min_host_version`/`max_host_version` window at `Initialize` (§3.1).
pub const HOST_VERSION: SemVer = SemVer::new(1, 0, 0);

/// `[a-z][a-z0-9_-]{0,31}` — used as URL namespace and table prefix.
pub fn is_valid_extension_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 32 {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_lowercase() {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for SemVer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let major = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing major version"))?
            .parse()?;
        let minor = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing minor version"))?
            .parse()?;
        let patch = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing patch version"))?
            .parse()?;
        Ok(Self::new(major, minor, patch))
    }
}

/// A single capability an extension needs from the router's IAM (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecl {
    pub name: String,
    pub description: String,
    pub resource: String,
    pub actions: BTreeSet<String>,
}

/// One endpoint an extension documents for its `/docs` page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocEndpoint {
    pub method: String,
    pub path: String,
    pub summary: String,
}

/// The declared documentation block served at `/ext/<name>/docs` (§6.1).
/// Extensions own the content; the router only serves it back verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Documentation {
    pub overview: String,
    pub endpoints: Vec<DocEndpoint>,
    pub data_collected: Vec<String>,
    pub examples: Vec<String>,
}

/// Immutable metadata an extension declares once, at registration (§3.1).
#[derive(Debug, Clone)]
pub struct ExtensionDescriptor {
    pub name: String,
    pub version: SemVer,
    pub min_host_version: SemVer,
    pub max_host_version: SemVer,
    pub description: String,
    pub author: String,
    pub license: String,
    pub homepage: String,
    pub tags: Vec<String>,
    pub required_permissions: Vec<PermissionDecl>,
    pub config_schema: JsonValue,
    /// Logical namespace; becomes the table prefix `ext_<schema>_`.
    pub database_schema: String,
    pub documentation: Documentation,
}

impl ExtensionDescriptor {
    pub fn url_prefix(&self) -> String {
        format!("/ext/{}", self.name)
    }

    pub fn table_prefix(&self) -> String {
        format!("ext_{}_", self.database_schema)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_extension_name(&self.name) {
            return Err(format!(
                "extension name `{}` must match [a-z][a-z0-9_-]{{0,31}}",
                self.name
            ));
        }
        if !is_valid_extension_name(&self.database_schema) {
            return Err(format!(
                "database_schema `{}` must match [a-z][a-z0-9_-]{{0,31}}",
                self.database_schema
            ));
        }
        if self.min_host_version > self.max_host_version {
            return Err("min_host_version must be <= max_host_version".to_string());
        }
        Ok(())
    }
}

/// The closed set of states an extension instance moves through (§3.2, §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtensionState {
    Discovered,
    Initialized,
    Started,
    Stopped,
    Failed,
}

impl std::fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExtensionState::Discovered => "discovered",
            ExtensionState::Initialized => "initialized",
            ExtensionState::Started => "started",
            ExtensionState::Stopped => "stopped",
            ExtensionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatusKind {
    Healthy,
    Degraded,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub ok: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthStatusKind,
    pub message: String,
    #[serde(with = "systemtime_secs")]
    pub checked_at: SystemTime,
    pub checks: Vec<HealthCheck>,
}

mod systemtime_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let secs = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        secs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_secs(secs))
    }
}

/// Record of one attempted state transition (§3.2 invariant 4, §4.B).
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: ExtensionState,
    pub to: ExtensionState,
    pub error: Option<String>,
    pub at: SystemTime,
}

/// Mutable per-extension runtime state owned by the registry (§3.2).
#[derive(Debug, Clone)]
pub struct ExtensionRuntimeState {
    pub state: ExtensionState,
    pub config_current: Option<JsonValue>,
    pub health_last: Option<HealthStatus>,
    pub health_checked_at: Option<SystemTime>,
    pub routes: Vec<String>,
    pub hooks: Vec<String>,
    pub migrations_applied: Vec<String>,
    pub transitions: Vec<TransitionRecord>,
}

impl Default for ExtensionRuntimeState {
    fn default() -> Self {
        Self {
            state: ExtensionState::Discovered,
            config_current: None,
            health_last: None,
            health_checked_at: None,
            routes: Vec::new(),
            hooks: Vec::new(),
            migrations_applied: Vec::new(),
            transitions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_extension_name("hugo"));
        assert!(is_valid_extension_name("a"));
        assert!(is_valid_extension_name("web-hooks_2"));
    }

    #[test]
    fn invalid_names() {
        assert!(!is_valid_extension_name(""));
        assert!(!is_valid_extension_name("Hugo"));
        assert!(!is_valid_extension_name("1hugo"));
        assert!(!is_valid_extension_name(&"a".repeat(33)));
    }

    #[test]
    fn semver_ordering() {
        assert!(SemVer::new(1, 0, 0) < SemVer::new(1, 1, 0));
        assert!(SemVer::new(0, 9, 9) < SemVer::new(1, 0, 0));
    }

    #[test]
    fn table_prefix_matches_contract() {
        let d = ExtensionDescriptor {
            name: "hugo".into(),
            version: SemVer::new(1, 0, 0),
            min_host_version: SemVer::new(1, 0, 0),
            max_host_version: SemVer::new(2, 0, 0),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            homepage: String::new(),
            tags: vec![],
            required_permissions: vec![],
            config_schema: serde_json::json!({}),
            database_schema: "hugo".into(),
            documentation: Documentation::default(),
        };
        assert_eq!(d.table_prefix(), "ext_hugo_");
        assert_eq!(d.url_prefix(), "/ext/hugo");
    }
}
