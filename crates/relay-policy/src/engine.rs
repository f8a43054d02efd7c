//! The policy engine: layered resolution and the three decisions.

use crate::audit::{AuditAction, AuditLog};
use crate::error::Result;
use crate::pattern::pattern_matches;
use crate::policy::{AgentPolicy, PolicyDecision, PolicySet, PolicySource};
use crate::WORKSPACE_POLICY_TTL;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Port for fetching the cloud workspace policy.
///
/// The cloud sync layer implements this; the engine caches results with a
/// 5-minute TTL and serves stale entries when a refresh fails.
#[async_trait]
pub trait WorkspacePolicyProvider: Send + Sync {
    /// Fetches the current workspace policy set.
    async fn fetch(&self) -> Result<Vec<AgentPolicy>>;
}

/// Engine settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicySettings {
    /// Use the strict built-in default instead of the permissive one.
    pub strict_mode: bool,
    /// Treat agents without an explicit policy record strictly.
    pub require_explicit_agents: bool,
}

impl PolicySettings {
    fn strict_default(&self) -> bool {
        self.strict_mode || self.require_explicit_agents
    }
}

struct WorkspaceCache {
    set: PolicySet,
    fetched_at: Option<Instant>,
}

/// The layered policy gate.
pub struct PolicyEngine {
    repo: PolicySet,
    local: PolicySet,
    workspace: RwLock<WorkspaceCache>,
    provider: Option<Arc<dyn WorkspacePolicyProvider>>,
    settings: PolicySettings,
    audit: AuditLog,
    spawn_counts: Mutex<HashMap<String, u32>>,
}

impl PolicyEngine {
    /// Creates an engine with explicit layers.
    #[must_use]
    pub fn new(
        repo: PolicySet,
        local: PolicySet,
        provider: Option<Arc<dyn WorkspacePolicyProvider>>,
        settings: PolicySettings,
    ) -> Self {
        Self {
            repo,
            local,
            workspace: RwLock::new(WorkspaceCache {
                set: PolicySet::default(),
                fetched_at: None,
            }),
            provider,
            settings,
            audit: AuditLog::new(),
            spawn_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the repo config file and the user policy directory, then builds
    /// the engine.
    ///
    /// # Errors
    ///
    /// Fails when a present policy file cannot be parsed.
    pub fn from_paths(
        repo_file: Option<&Path>,
        policies_dir: Option<&Path>,
        provider: Option<Arc<dyn WorkspacePolicyProvider>>,
        settings: PolicySettings,
    ) -> Result<Self> {
        let repo = match repo_file {
            Some(path) if path.exists() => PolicySet::load_file(path)?,
            _ => PolicySet::default(),
        };
        let local = match policies_dir {
            Some(dir) => PolicySet::load_dir(dir)?,
            None => PolicySet::default(),
        };
        Ok(Self::new(repo, local, provider, settings))
    }

    /// A permissive engine with no configured layers; used by tests.
    #[must_use]
    pub fn permissive() -> Self {
        Self::new(
            PolicySet::default(),
            PolicySet::default(),
            None,
            PolicySettings::default(),
        )
    }

    /// The audit trail.
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    async fn workspace_set(&self) -> PolicySet {
        let Some(provider) = &self.provider else {
            return PolicySet::default();
        };

        let fresh = {
            let cache = self.workspace.read();
            cache
                .fetched_at
                .is_some_and(|t| t.elapsed() < WORKSPACE_POLICY_TTL)
        };
        if fresh {
            return self.workspace.read().set.clone();
        }

        match provider.fetch().await {
            Ok(policies) => {
                let set = PolicySet::new(policies);
                let mut cache = self.workspace.write();
                cache.set = set.clone();
                cache.fetched_at = Some(Instant::now());
                set
            }
            Err(e) => {
                // Stale-on-error: keep serving the old snapshot.
                warn!(error = %e, "workspace policy refresh failed; serving stale");
                let mut cache = self.workspace.write();
                cache.fetched_at = Some(Instant::now());
                cache.set.clone()
            }
        }
    }

    /// Resolves the effective policy for an agent, walking the layers in
    /// precedence order.
    async fn resolve(&self, agent: &str) -> (AgentPolicy, PolicySource) {
        if let Some(policy) = self.repo.lookup(agent) {
            return (policy.clone(), PolicySource::Repo);
        }
        if let Some(policy) = self.local.lookup(agent) {
            return (policy.clone(), PolicySource::Local);
        }
        if let Some(policy) = self.workspace_set().await.lookup(agent) {
            return (policy.clone(), PolicySource::Workspace);
        }
        let default = if self.settings.strict_default() {
            AgentPolicy::strict()
        } else {
            AgentPolicy::permissive()
        };
        (default, PolicySource::Default)
    }

    /// Decides whether `spawner` may spawn `target` under `cli`.
    pub async fn can_spawn(&self, spawner: &str, target: &str, cli: Option<&str>) -> PolicyDecision {
        let (policy, source) = self.resolve(spawner).await;
        let matched = Some(policy.pattern.clone());

        let decision = if policy.can_spawn == Some(false)
            || (policy.can_spawn.is_none() && self.settings.strict_default())
        {
            PolicyDecision::deny(
                format!("{spawner} is not allowed to spawn agents"),
                source,
                matched,
            )
        } else if let Some(max) = policy.max_spawns {
            let used = self.spawn_counts.lock().get(spawner).copied().unwrap_or(0);
            if used >= max {
                PolicyDecision::deny(
                    format!("{spawner} reached its spawn limit of {max}"),
                    source,
                    matched,
                )
            } else {
                self.check_spawn_target(target, source, matched).await
            }
        } else {
            self.check_spawn_target(target, source, matched).await
        };

        if decision.allowed {
            *self
                .spawn_counts
                .lock()
                .entry(spawner.to_string())
                .or_insert(0) += 1;
        }

        self.audit.record(
            AuditAction::Spawn {
                spawner: spawner.to_string(),
                target: target.to_string(),
                cli: cli.map(str::to_string),
            },
            decision.allowed,
            &decision.reason,
            decision.policy_source,
        );
        debug!(
            spawner,
            target,
            allowed = decision.allowed,
            source = %decision.policy_source,
            "spawn decision"
        );
        decision
    }

    async fn check_spawn_target(
        &self,
        target: &str,
        source: PolicySource,
        matched: Option<String>,
    ) -> PolicyDecision {
        let (target_policy, target_source) = self.resolve(target).await;
        if !target_policy.can_be_spawned {
            return PolicyDecision::deny(
                format!("{target} cannot be spawned"),
                target_source,
                Some(target_policy.pattern),
            );
        }
        PolicyDecision::allow("spawn permitted", source, matched)
    }

    /// Decides whether `sender` may message `recipient`.
    pub async fn can_message(&self, sender: &str, recipient: &str) -> PolicyDecision {
        let (policy, source) = self.resolve(sender).await;
        let matched = Some(policy.pattern.clone());

        let decision = match &policy.can_message {
            Some(allowed) if !allowed.iter().any(|p| pattern_matches(p, recipient)) => {
                PolicyDecision::deny(
                    format!("{sender} may not message {recipient}"),
                    source,
                    matched,
                )
            }
            _ => PolicyDecision::allow("message permitted", source, matched),
        };

        self.audit.record(
            AuditAction::Message {
                sender: sender.to_string(),
                recipient: recipient.to_string(),
            },
            decision.allowed,
            &decision.reason,
            decision.policy_source,
        );
        decision
    }

    /// Decides whether `agent` may use `tool`.
    pub async fn can_use_tool(&self, agent: &str, tool: &str) -> PolicyDecision {
        let (policy, source) = self.resolve(agent).await;
        let matched = Some(policy.pattern.clone());

        let decision = match &policy.allowed_tools {
            Some(tools) if !tools.iter().any(|p| pattern_matches(p, tool)) => {
                PolicyDecision::deny(format!("{agent} may not use {tool}"), source, matched)
            }
            _ => PolicyDecision::allow("tool permitted", source, matched),
        };

        self.audit.record(
            AuditAction::Tool {
                agent: agent.to_string(),
                tool: tool.to_string(),
            },
            decision.allowed,
            &decision.reason,
            decision.policy_source,
        );
        decision
    }
}
