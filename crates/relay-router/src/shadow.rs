//! Shadow observer relationships.

use serde::{Deserialize, Serialize};

/// When a shadow is expected to speak up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShadowTrigger {
    /// Only when the primary explicitly asks.
    ExplicitAsk,
    /// On every message the primary handles.
    AllMessages,
    /// When the primary reports an error.
    Errors,
    /// When the primary faces a decision.
    Decisions,
}

impl std::fmt::Display for ShadowTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShadowTrigger::ExplicitAsk => write!(f, "EXPLICIT_ASK"),
            ShadowTrigger::AllMessages => write!(f, "ALL_MESSAGES"),
            ShadowTrigger::Errors => write!(f, "ERRORS"),
            ShadowTrigger::Decisions => write!(f, "DECISIONS"),
        }
    }
}

/// Which side of a conversation a shadow copy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowDirection {
    /// A message the primary received.
    Incoming,
    /// A message the primary sent.
    Outgoing,
}

impl std::fmt::Display for ShadowDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShadowDirection::Incoming => write!(f, "incoming"),
            ShadowDirection::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// One shadow bound to a primary. A shadow has exactly one primary;
/// re-binding atomically replaces the prior entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowBinding {
    /// The observing agent.
    pub shadow: String,
    /// Triggers the shadow responds to.
    pub speak_on: Vec<ShadowTrigger>,
    /// Copy messages the primary receives.
    pub receive_incoming: bool,
    /// Copy messages the primary sends.
    pub receive_outgoing: bool,
}

impl ShadowBinding {
    /// A binding that observes both directions and speaks only when asked.
    #[must_use]
    pub fn observer(shadow: impl Into<String>) -> Self {
        Self {
            shadow: shadow.into(),
            speak_on: vec![ShadowTrigger::ExplicitAsk],
            receive_incoming: true,
            receive_outgoing: true,
        }
    }

    /// True when this binding fires for the given trigger.
    #[must_use]
    pub fn fires_on(&self, trigger: ShadowTrigger) -> bool {
        self.speak_on
            .iter()
            .any(|t| *t == trigger || *t == ShadowTrigger::AllMessages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_wire_names() {
        let json = serde_json::to_string(&ShadowTrigger::ExplicitAsk).unwrap();
        assert_eq!(json, "\"EXPLICIT_ASK\"");
    }

    #[test]
    fn all_messages_fires_for_everything() {
        let binding = ShadowBinding {
            shadow: "observer".into(),
            speak_on: vec![ShadowTrigger::AllMessages],
            receive_incoming: true,
            receive_outgoing: false,
        };
        assert!(binding.fires_on(ShadowTrigger::ExplicitAsk));
        assert!(binding.fires_on(ShadowTrigger::Errors));
    }

    #[test]
    fn specific_trigger_only_fires_for_itself() {
        let binding = ShadowBinding {
            shadow: "observer".into(),
            speak_on: vec![ShadowTrigger::Errors],
            receive_incoming: true,
            receive_outgoing: true,
        };
        assert!(binding.fires_on(ShadowTrigger::Errors));
        assert!(!binding.fires_on(ShadowTrigger::Decisions));
    }
}
