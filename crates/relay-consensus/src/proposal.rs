//! Proposal, vote, and tally types with the decision rules.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default supermajority threshold (two thirds).
pub const DEFAULT_SUPERMAJORITY: f64 = 2.0 / 3.0;

/// How a proposal's votes are tallied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusType {
    /// More approvals than rejections.
    Majority,
    /// Every participant must approve.
    Unanimous,
    /// Approvals must reach a threshold fraction of votes cast.
    Supermajority,
    /// Majority over per-agent weights.
    Weighted,
    /// Majority, but only if enough votes were cast.
    Quorum,
}

impl ConsensusType {
    /// Parse from the command form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "majority" => Some(ConsensusType::Majority),
            "unanimous" => Some(ConsensusType::Unanimous),
            "supermajority" => Some(ConsensusType::Supermajority),
            "weighted" => Some(ConsensusType::Weighted),
            "quorum" => Some(ConsensusType::Quorum),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusType::Majority => write!(f, "majority"),
            ConsensusType::Unanimous => write!(f, "unanimous"),
            ConsensusType::Supermajority => write!(f, "supermajority"),
            ConsensusType::Weighted => write!(f, "weighted"),
            ConsensusType::Quorum => write!(f, "quorum"),
        }
    }
}

/// A participant's vote value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteValue {
    /// In favor.
    Approve,
    /// Against.
    Reject,
    /// Counted for quorum, not for either side.
    Abstain,
}

impl VoteValue {
    /// Parse from the command form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "approve" | "yes" => Some(VoteValue::Approve),
            "reject" | "no" => Some(VoteValue::Reject),
            "abstain" => Some(VoteValue::Abstain),
            _ => None,
        }
    }
}

/// One participant's vote. A new vote from the same agent replaces the old.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// The voting agent.
    pub agent: String,
    /// The vote value.
    pub value: VoteValue,
    /// Optional rationale.
    pub reason: Option<String>,
    /// Millisecond timestamp.
    pub ts: u64,
}

/// Lifecycle status of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Accepting votes.
    Pending,
    /// Decided in favor.
    Approved,
    /// Decided against.
    Rejected,
    /// No decisive outcome.
    NoConsensus,
    /// Timer fired before a decision.
    Expired,
    /// Withdrawn by the proposer.
    Cancelled,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalStatus::Pending => write!(f, "pending"),
            ProposalStatus::Approved => write!(f, "approved"),
            ProposalStatus::Rejected => write!(f, "rejected"),
            ProposalStatus::NoConsensus => write!(f, "no_consensus"),
            ProposalStatus::Expired => write!(f, "expired"),
            ProposalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A consensus request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Proposal id.
    pub id: String,
    /// Short title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// The proposing agent.
    pub proposer: String,
    /// Declared participants; only their votes tally.
    pub participants: Vec<String>,
    /// Tally rule.
    pub consensus_type: ConsensusType,
    /// Supermajority threshold override.
    pub threshold: Option<f64>,
    /// Minimum votes for a quorum decision.
    pub quorum: Option<usize>,
    /// Per-agent weights for weighted tallies (default weight 1).
    pub weights: Option<HashMap<String, f64>>,
    /// Voting window in milliseconds.
    pub timeout_ms: u64,
    /// Millisecond creation timestamp.
    pub created_at: u64,
    /// Millisecond expiry timestamp.
    pub expires_at: u64,
    /// Current status.
    pub status: ProposalStatus,
    /// Votes cast, at most one per participant.
    pub votes: Vec<Vote>,
    /// Router thread all related messages share.
    pub thread: String,
}

/// A computed tally over a proposal's votes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tally {
    /// Sum of approving weight.
    pub approve_weight: f64,
    /// Sum of rejecting weight.
    pub reject_weight: f64,
    /// Abstentions cast.
    pub abstain_count: usize,
    /// Total votes cast (including abstentions).
    pub votes_cast: usize,
    /// Participants who have not voted.
    pub non_voters: Vec<String>,
}

impl Proposal {
    fn weight_of(&self, agent: &str) -> f64 {
        match self.consensus_type {
            ConsensusType::Weighted => self
                .weights
                .as_ref()
                .and_then(|w| w.get(agent))
                .copied()
                .unwrap_or(1.0),
            _ => 1.0,
        }
    }

    /// True when `agent` is a declared participant.
    #[must_use]
    pub fn is_participant(&self, agent: &str) -> bool {
        self.participants.iter().any(|p| p == agent)
    }

    /// The vote currently held by `agent`, if any.
    #[must_use]
    pub fn vote_of(&self, agent: &str) -> Option<&Vote> {
        self.votes.iter().find(|v| v.agent == agent)
    }

    /// Computes the current tally. Only participants' votes count.
    #[must_use]
    pub fn tally(&self) -> Tally {
        let mut approve_weight = 0.0;
        let mut reject_weight = 0.0;
        let mut abstain_count = 0;
        let mut votes_cast = 0;

        for vote in &self.votes {
            if !self.is_participant(&vote.agent) {
                continue;
            }
            votes_cast += 1;
            match vote.value {
                VoteValue::Approve => approve_weight += self.weight_of(&vote.agent),
                VoteValue::Reject => reject_weight += self.weight_of(&vote.agent),
                VoteValue::Abstain => abstain_count += 1,
            }
        }

        let non_voters = self
            .participants
            .iter()
            .filter(|p| self.vote_of(p).is_none())
            .cloned()
            .collect();

        Tally {
            approve_weight,
            reject_weight,
            abstain_count,
            votes_cast,
            non_voters,
        }
    }

    /// The supermajority threshold in effect.
    #[must_use]
    pub fn effective_threshold(&self) -> f64 {
        self.threshold.unwrap_or(DEFAULT_SUPERMAJORITY)
    }

    /// Decides the proposal from the votes cast so far. Used at expiry and
    /// when every participant has voted.
    #[must_use]
    pub fn decide(&self) -> ProposalStatus {
        let tally = self.tally();
        match self.consensus_type {
            ConsensusType::Majority | ConsensusType::Weighted => {
                decide_majority(tally.approve_weight, tally.reject_weight)
            }
            ConsensusType::Unanimous => {
                if tally.reject_weight > 0.0 {
                    ProposalStatus::Rejected
                } else if tally.non_voters.is_empty()
                    && tally.abstain_count == 0
                    && !self.participants.is_empty()
                {
                    ProposalStatus::Approved
                } else {
                    ProposalStatus::NoConsensus
                }
            }
            ConsensusType::Supermajority => {
                if tally.votes_cast > 0
                    && tally.approve_weight / tally.votes_cast as f64
                        >= self.effective_threshold()
                {
                    ProposalStatus::Approved
                } else {
                    ProposalStatus::NoConsensus
                }
            }
            ConsensusType::Quorum => {
                let quorum = self.quorum.unwrap_or(self.participants.len());
                if tally.votes_cast < quorum {
                    ProposalStatus::NoConsensus
                } else {
                    decide_majority(tally.approve_weight, tally.reject_weight)
                }
            }
        }
    }

    /// Returns the outcome as soon as it is mathematically determined given
    /// the votes cast and every possible assignment of the remaining votes.
    #[must_use]
    pub fn clinched(&self) -> Option<ProposalStatus> {
        let tally = self.tally();
        if tally.non_voters.is_empty() {
            return Some(self.decide());
        }

        let remaining_weight: f64 = tally
            .non_voters
            .iter()
            .map(|agent| self.weight_of(agent))
            .sum();

        match self.consensus_type {
            ConsensusType::Majority | ConsensusType::Weighted => {
                if tally.approve_weight > tally.reject_weight + remaining_weight {
                    Some(ProposalStatus::Approved)
                } else if tally.reject_weight > tally.approve_weight + remaining_weight {
                    Some(ProposalStatus::Rejected)
                } else {
                    None
                }
            }
            ConsensusType::Unanimous => {
                // A single reject settles it; approval needs every vote in.
                if tally.reject_weight > 0.0 {
                    Some(ProposalStatus::Rejected)
                } else {
                    None
                }
            }
            ConsensusType::Supermajority => {
                let threshold = self.effective_threshold();
                let remaining = tally.non_voters.len() as f64;
                let total_if_all_vote = tally.votes_cast as f64 + remaining;
                // Already past the bar even if every remaining vote rejects.
                if total_if_all_vote > 0.0
                    && tally.approve_weight / total_if_all_vote >= threshold
                {
                    Some(ProposalStatus::Approved)
                // Out of reach even if every remaining vote approves.
                } else if total_if_all_vote > 0.0
                    && (tally.approve_weight + remaining) / total_if_all_vote < threshold
                {
                    Some(ProposalStatus::NoConsensus)
                } else {
                    None
                }
            }
            ConsensusType::Quorum => {
                let quorum = self.quorum.unwrap_or(self.participants.len());
                if quorum > self.participants.len() {
                    // Unreachable quorum resolves immediately.
                    return Some(ProposalStatus::NoConsensus);
                }
                if tally.votes_cast < quorum {
                    return None;
                }
                if tally.approve_weight > tally.reject_weight + remaining_weight {
                    Some(ProposalStatus::Approved)
                } else if tally.reject_weight > tally.approve_weight + remaining_weight {
                    Some(ProposalStatus::Rejected)
                } else {
                    None
                }
            }
        }
    }
}

fn decide_majority(approve: f64, reject: f64) -> ProposalStatus {
    if approve > reject {
        ProposalStatus::Approved
    } else if reject > approve {
        ProposalStatus::Rejected
    } else {
        ProposalStatus::NoConsensus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn proposal(consensus_type: ConsensusType, participants: &[&str]) -> Proposal {
        Proposal {
            id: "p1".into(),
            title: "test".into(),
            description: String::new(),
            proposer: "lead".into(),
            participants: participants.iter().map(ToString::to_string).collect(),
            consensus_type,
            threshold: None,
            quorum: None,
            weights: None,
            timeout_ms: 60_000,
            created_at: 0,
            expires_at: 60_000,
            status: ProposalStatus::Pending,
            votes: Vec::new(),
            thread: "consensus-test".into(),
        }
    }

    fn vote(agent: &str, value: VoteValue) -> Vote {
        Vote {
            agent: agent.into(),
            value,
            reason: None,
            ts: 0,
        }
    }

    #[test]
    fn majority_clinches_past_half() {
        let mut p = proposal(ConsensusType::Majority, &["a", "b", "c"]);
        p.votes.push(vote("a", VoteValue::Approve));
        assert_eq!(p.clinched(), None);

        p.votes.push(vote("b", VoteValue::Approve));
        // 2 approve vs at most 1 future reject.
        assert_eq!(p.clinched(), Some(ProposalStatus::Approved));

        let tally = p.tally();
        assert_eq!(tally.approve_weight, 2.0);
        assert_eq!(tally.reject_weight, 0.0);
        assert_eq!(tally.non_voters, vec!["c".to_string()]);
    }

    #[test]
    fn majority_tie_is_no_consensus() {
        let mut p = proposal(ConsensusType::Majority, &["a", "b"]);
        p.votes.push(vote("a", VoteValue::Approve));
        p.votes.push(vote("b", VoteValue::Reject));
        assert_eq!(p.decide(), ProposalStatus::NoConsensus);
        assert_eq!(p.clinched(), Some(ProposalStatus::NoConsensus));
    }

    #[test]
    fn abstentions_count_toward_neither_side() {
        let mut p = proposal(ConsensusType::Majority, &["a", "b", "c"]);
        p.votes.push(vote("a", VoteValue::Approve));
        p.votes.push(vote("b", VoteValue::Abstain));
        p.votes.push(vote("c", VoteValue::Abstain));
        assert_eq!(p.decide(), ProposalStatus::Approved);
    }

    #[test]
    fn non_participant_votes_ignored() {
        let mut p = proposal(ConsensusType::Majority, &["a", "b"]);
        p.votes.push(vote("mallory", VoteValue::Reject));
        p.votes.push(vote("a", VoteValue::Approve));
        p.votes.push(vote("b", VoteValue::Approve));
        assert_eq!(p.decide(), ProposalStatus::Approved);
        assert_eq!(p.tally().votes_cast, 2);
    }

    #[test]
    fn unanimous_single_reject_clinches() {
        let mut p = proposal(ConsensusType::Unanimous, &["a", "b", "c"]);
        p.votes.push(vote("a", VoteValue::Reject));
        assert_eq!(p.clinched(), Some(ProposalStatus::Rejected));
    }

    #[test]
    fn unanimous_needs_every_approval() {
        let mut p = proposal(ConsensusType::Unanimous, &["a", "b"]);
        p.votes.push(vote("a", VoteValue::Approve));
        assert_eq!(p.clinched(), None);

        p.votes.push(vote("b", VoteValue::Approve));
        assert_eq!(p.clinched(), Some(ProposalStatus::Approved));
    }

    #[test]
    fn unanimous_abstain_blocks_approval() {
        let mut p = proposal(ConsensusType::Unanimous, &["a", "b"]);
        p.votes.push(vote("a", VoteValue::Approve));
        p.votes.push(vote("b", VoteValue::Abstain));
        assert_eq!(p.decide(), ProposalStatus::NoConsensus);
    }

    #[test]
    fn supermajority_default_two_thirds() {
        let mut p = proposal(ConsensusType::Supermajority, &["a", "b", "c"]);
        p.votes.push(vote("a", VoteValue::Approve));
        p.votes.push(vote("b", VoteValue::Approve));
        p.votes.push(vote("c", VoteValue::Reject));
        // 2/3 exactly meets the default threshold.
        assert_eq!(p.decide(), ProposalStatus::Approved);
    }

    #[test]
    fn supermajority_unreachable_clinches_no_consensus() {
        let mut p = proposal(ConsensusType::Supermajority, &["a", "b", "c"]);
        p.votes.push(vote("a", VoteValue::Reject));
        p.votes.push(vote("b", VoteValue::Reject));
        // Even an approving third vote gives 1/3 < 2/3.
        assert_eq!(p.clinched(), Some(ProposalStatus::NoConsensus));
    }

    #[test]
    fn weighted_sums_respect_weights() {
        let mut p = proposal(ConsensusType::Weighted, &["a", "b", "c"]);
        let mut weights = HashMap::new();
        weights.insert("a".to_string(), 3.0);
        p.weights = Some(weights);

        p.votes.push(vote("a", VoteValue::Approve));
        // a's weight (3) beats b+c's maximum combined weight (1 + 1).
        assert_eq!(p.clinched(), Some(ProposalStatus::Approved));
    }

    #[test]
    fn quorum_short_of_votes_is_no_consensus() {
        let mut p = proposal(ConsensusType::Quorum, &["a", "b", "c", "d"]);
        p.quorum = Some(3);
        p.votes.push(vote("a", VoteValue::Approve));
        p.votes.push(vote("b", VoteValue::Approve));
        // Majority clinched but quorum not met: no early resolution.
        assert_eq!(p.clinched(), None);
        assert_eq!(p.decide(), ProposalStatus::NoConsensus);

        p.votes.push(vote("c", VoteValue::Abstain));
        assert_eq!(p.clinched(), Some(ProposalStatus::Approved));
    }

    #[test]
    fn unreachable_quorum_resolves_immediately() {
        let mut p = proposal(ConsensusType::Quorum, &["a", "b"]);
        p.quorum = Some(5);
        assert_eq!(p.clinched(), Some(ProposalStatus::NoConsensus));
    }

    #[test]
    fn decisions_are_deterministic() {
        let build = || {
            let mut p = proposal(ConsensusType::Weighted, &["a", "b", "c"]);
            let mut weights = HashMap::new();
            weights.insert("b".to_string(), 2.5);
            p.weights = Some(weights);
            p.votes.push(vote("a", VoteValue::Approve));
            p.votes.push(vote("b", VoteValue::Reject));
            p.votes.push(vote("c", VoteValue::Approve));
            p
        };
        assert_eq!(build().decide(), build().decide());
        assert_eq!(build().decide(), ProposalStatus::Rejected);
    }
}
