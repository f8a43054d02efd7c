//! Policy records, decision types, and ordered policy sets.

use crate::error::{PolicyError, Result};
use crate::pattern::{is_exact, pattern_matches};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A single policy record keyed by an agent name pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPolicy {
    /// The name pattern this record applies to. Filled from the file's map
    /// key when loading.
    #[serde(default)]
    pub pattern: String,
    /// Tool name patterns the agent may use. `None` means all tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    /// Whether the agent may spawn others. `None` falls back to the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_spawn: Option<bool>,
    /// Recipient name patterns the agent may message. `None` means anyone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_message: Option<Vec<String>>,
    /// Cap on how many agents this one may spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spawns: Option<u32>,
    /// Messages per minute the agent may send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_min: Option<u32>,
    /// Whether other agents may spawn this one.
    #[serde(default = "default_true")]
    pub can_be_spawned: bool,
}

fn default_true() -> bool {
    true
}

impl AgentPolicy {
    /// The built-in permissive policy.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            pattern: "*".to_string(),
            ..Self::default()
        }
    }

    /// The strict default: read-only tools, no spawning, messages only to
    /// coordination agents.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            pattern: "*".to_string(),
            allowed_tools: Some(vec![
                "Read".to_string(),
                "Grep".to_string(),
                "Glob".to_string(),
            ]),
            can_spawn: Some(false),
            can_message: Some(vec!["Lead".to_string(), "Coordinator".to_string()]),
            max_spawns: None,
            rate_limit_per_min: None,
            can_be_spawned: true,
        }
    }
}

/// Where a decision's policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySource {
    /// The repo-level config file.
    Repo,
    /// User-level policy files.
    Local,
    /// Cloud workspace policy.
    Workspace,
    /// The built-in default.
    Default,
}

impl std::fmt::Display for PolicySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicySource::Repo => write!(f, "repo"),
            PolicySource::Local => write!(f, "local"),
            PolicySource::Workspace => write!(f, "workspace"),
            PolicySource::Default => write!(f, "default"),
        }
    }
}

/// The outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDecision {
    /// Whether the action is allowed.
    pub allowed: bool,
    /// Human-readable reason; surfaced by the caller on denial.
    pub reason: String,
    /// Which layer decided.
    pub policy_source: PolicySource,
    /// The pattern of the record that matched, when one did.
    pub matched_policy: Option<String>,
}

impl PolicyDecision {
    /// An allowing decision.
    #[must_use]
    pub fn allow(
        reason: impl Into<String>,
        source: PolicySource,
        matched: Option<String>,
    ) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            policy_source: source,
            matched_policy: matched,
        }
    }

    /// A denying decision.
    #[must_use]
    pub fn deny(
        reason: impl Into<String>,
        source: PolicySource,
        matched: Option<String>,
    ) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            policy_source: source,
            matched_policy: matched,
        }
    }
}

/// An ordered set of policies with first-match-wins lookup.
///
/// Exact patterns always win over wildcard forms; among wildcard forms the
/// first in declaration order wins.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: Vec<AgentPolicy>,
}

impl PolicySet {
    /// Creates a set preserving declaration order.
    #[must_use]
    pub fn new(policies: Vec<AgentPolicy>) -> Self {
        Self { policies }
    }

    /// True when no policies are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Appends records from another set (later records lose ties).
    pub fn merge(&mut self, other: PolicySet) {
        self.policies.extend(other.policies);
    }

    /// Finds the effective policy for an agent name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&AgentPolicy> {
        self.policies
            .iter()
            .find(|p| is_exact(&p.pattern) && pattern_matches(&p.pattern, name))
            .or_else(|| {
                self.policies
                    .iter()
                    .find(|p| !is_exact(&p.pattern) && pattern_matches(&p.pattern, name))
            })
    }

    /// Parses a policy file: a map of pattern to record, YAML or JSON by
    /// extension.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or unparseable content.
    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let is_json = path.extension().is_some_and(|e| e == "json");

        // BTreeMap keeps a stable order for map-keyed files.
        let map: BTreeMap<String, AgentPolicy> = if is_json {
            serde_json::from_str(&raw).map_err(|e| PolicyError::Malformed {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&raw).map_err(|e| PolicyError::Malformed {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        };

        let policies = map
            .into_iter()
            .map(|(pattern, mut policy)| {
                policy.pattern = pattern;
                policy
            })
            .collect();
        Ok(Self::new(policies))
    }

    /// Loads and merges every `*.yaml` / `*.yml` / `*.json` file in a
    /// directory, in filename order. A missing directory yields an empty set.
    ///
    /// # Errors
    ///
    /// Fails when a present file cannot be read or parsed.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut set = Self::default();
        if !dir.is_dir() {
            return Ok(set);
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .is_some_and(|e| e == "yaml" || e == "yml" || e == "json")
            })
            .collect();
        paths.sort();

        for path in paths {
            set.merge(Self::load_file(&path)?);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy(pattern: &str) -> AgentPolicy {
        AgentPolicy {
            pattern: pattern.to_string(),
            ..AgentPolicy::default()
        }
    }

    #[test]
    fn exact_match_beats_pattern_order() {
        let set = PolicySet::new(vec![policy("worker-*"), policy("worker-1")]);
        assert_eq!(set.lookup("worker-1").unwrap().pattern, "worker-1");
        assert_eq!(set.lookup("worker-2").unwrap().pattern, "worker-*");
    }

    #[test]
    fn first_pattern_wins_among_wildcards() {
        let set = PolicySet::new(vec![policy("worker-*"), policy("*")]);
        assert_eq!(set.lookup("worker-9").unwrap().pattern, "worker-*");
        assert_eq!(set.lookup("someone").unwrap().pattern, "*");
    }

    #[test]
    fn no_match_is_none() {
        let set = PolicySet::new(vec![policy("lead")]);
        assert!(set.lookup("intern").is_none());
    }

    #[test]
    fn strict_default_shape() {
        let strict = AgentPolicy::strict();
        assert_eq!(strict.can_spawn, Some(false));
        assert_eq!(
            strict.allowed_tools.as_deref(),
            Some(["Read".to_string(), "Grep".to_string(), "Glob".to_string()].as_slice())
        );
    }

    #[test]
    fn load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.yaml");
        std::fs::write(
            &path,
            "worker-*:\n  canSpawn: false\n  allowedTools: [Read]\nlead:\n  maxSpawns: 4\n",
        )
        .unwrap();

        let set = PolicySet::load_file(&path).unwrap();
        assert_eq!(set.len(), 2);
        let worker = set.lookup("worker-3").unwrap();
        assert_eq!(worker.can_spawn, Some(false));
        assert_eq!(set.lookup("lead").unwrap().max_spawns, Some(4));
    }

    #[test]
    fn load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(&path, r#"{"*": {"canBeSpawned": false}}"#).unwrap();

        let set = PolicySet::load_file(&path).unwrap();
        assert!(!set.lookup("anyone").unwrap().can_be_spawned);
    }

    #[test]
    fn load_dir_merges_in_filename_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("10-base.yaml"), "'*':\n  canSpawn: true\n").unwrap();
        std::fs::write(
            dir.path().join("20-override.yaml"),
            "'*':\n  canSpawn: false\n",
        )
        .unwrap();

        let set = PolicySet::load_dir(dir.path()).unwrap();
        // Earlier file wins: merge appends, lookup is first-match.
        assert_eq!(set.lookup("x").unwrap().can_spawn, Some(true));
    }

    #[test]
    fn load_dir_missing_is_empty() {
        let set = PolicySet::load_dir(Path::new("/nonexistent/policies")).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            PolicySet::load_file(&path),
            Err(PolicyError::Malformed { .. })
        ));
    }
}
