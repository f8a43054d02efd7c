//! Audit trail for policy decisions.

use crate::policy::PolicySource;
use crate::AUDIT_CAPACITY;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// The action a decision was made about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditAction {
    /// A spawn request.
    Spawn {
        /// The requesting agent.
        spawner: String,
        /// The agent to be spawned.
        target: String,
        /// The CLI the target would run under.
        cli: Option<String>,
    },
    /// A message routing request.
    Message {
        /// The sending agent.
        sender: String,
        /// The recipient.
        recipient: String,
    },
    /// A tool-use request.
    Tool {
        /// The requesting agent.
        agent: String,
        /// The tool name.
        tool: String,
    },
}

/// One audited decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    /// Millisecond timestamp.
    pub ts: u64,
    /// What was decided about.
    #[serde(flatten)]
    pub action: AuditAction,
    /// Whether it was allowed.
    pub allowed: bool,
    /// The decision reason.
    pub reason: String,
    /// Which policy layer decided.
    pub source: PolicySource,
}

/// Bounded in-memory audit ring. When the ring reaches capacity the oldest
/// half is dropped.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry, halving the ring on overflow.
    pub fn record(&self, action: AuditAction, allowed: bool, reason: &str, source: PolicySource) {
        let mut entries = self.entries.lock();
        if entries.len() >= AUDIT_CAPACITY {
            let keep_from = entries.len() / 2;
            entries.drain(..keep_from);
        }
        entries.push_back(AuditEntry {
            ts: now_ms(),
            action,
            allowed,
            reason: reason.to_string(),
            source,
        });
    }

    /// Snapshot of the current entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
