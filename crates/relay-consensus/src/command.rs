//! Text command layer.
//!
//! Agents drive the engine with plain-text commands embedded in message
//! bodies:
//!
//! ```text
//! PROPOSE majority participants=alice,bob,carol timeout=60000 :: Ship v2 :: Cut the release branch
//! VOTE 1a2b3c4d5e6f approve looks good
//! CANCEL 1a2b3c4d5e6f
//! ```

use crate::engine::ProposalRequest;
use crate::error::{ConsensusError, Result};
use crate::proposal::{ConsensusType, Proposal, ProposalStatus, Tally, VoteValue};
use std::collections::HashMap;

/// A parsed consensus command.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusCommand {
    /// Create a proposal.
    Propose(ProposalRequestParts),
    /// Cast a vote.
    Vote {
        /// Target proposal.
        proposal_id: String,
        /// The vote.
        value: VoteValue,
        /// Optional trailing rationale.
        reason: Option<String>,
    },
    /// Cancel a proposal.
    Cancel {
        /// Target proposal.
        proposal_id: String,
    },
}

/// The pieces of a `PROPOSE` command, before the proposer is known.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRequestParts {
    /// Tally rule.
    pub consensus_type: ConsensusType,
    /// Supermajority threshold override.
    pub threshold: Option<f64>,
    /// Quorum size.
    pub quorum: Option<usize>,
    /// Voting window.
    pub timeout_ms: Option<u64>,
    /// Declared participants.
    pub participants: Vec<String>,
    /// Per-agent weights.
    pub weights: Option<HashMap<String, f64>>,
    /// Title.
    pub title: String,
    /// Description.
    pub description: String,
}

impl ProposalRequestParts {
    /// Completes the request with the proposing agent.
    #[must_use]
    pub fn into_request(self, proposer: &str) -> ProposalRequest {
        ProposalRequest {
            title: self.title,
            description: self.description,
            proposer: proposer.to_string(),
            participants: self.participants,
            consensus_type: self.consensus_type,
            threshold: self.threshold,
            quorum: self.quorum,
            weights: self.weights,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Recognizes and parses a consensus command in a message body.
///
/// Returns `None` for bodies that are not consensus commands; commands that
/// are recognized but malformed return `Some(Err(..))`.
#[must_use]
pub fn parse_command(body: &str) -> Option<Result<ConsensusCommand>> {
    let trimmed = body.trim();
    let keyword = trimmed.split_whitespace().next()?;
    match keyword.to_uppercase().as_str() {
        "PROPOSE" => Some(parse_propose(trimmed)),
        "VOTE" => Some(parse_vote(trimmed)),
        "CANCEL" => Some(parse_cancel(trimmed)),
        _ => None,
    }
}

fn parse_propose(body: &str) -> Result<ConsensusCommand> {
    // Split off `:: title [:: description]` first.
    let mut sections = body.splitn(3, "::").map(str::trim);
    let head = sections.next().unwrap_or_default();
    let title = sections
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ConsensusError::MalformedCommand("PROPOSE needs ':: <title>'".into()))?;
    let description = sections.next().unwrap_or_default();

    let mut words = head.split_whitespace();
    words.next(); // the PROPOSE keyword

    let type_word = words
        .next()
        .ok_or_else(|| ConsensusError::MalformedCommand("PROPOSE needs a consensus type".into()))?;
    let consensus_type = ConsensusType::parse(type_word).ok_or_else(|| {
        ConsensusError::MalformedCommand(format!("unknown consensus type: {type_word}"))
    })?;

    let mut threshold = None;
    let mut quorum = None;
    let mut timeout_ms = None;
    let mut participants: Vec<String> = Vec::new();
    let mut weights: Option<HashMap<String, f64>> = None;

    for word in words {
        let Some((key, value)) = word.split_once('=') else {
            return Err(ConsensusError::MalformedCommand(format!(
                "expected key=value, got: {word}"
            )));
        };
        match key {
            "threshold" => {
                threshold = Some(value.parse().map_err(|_| {
                    ConsensusError::MalformedCommand(format!("bad threshold: {value}"))
                })?);
            }
            "quorum" => {
                quorum = Some(value.parse().map_err(|_| {
                    ConsensusError::MalformedCommand(format!("bad quorum: {value}"))
                })?);
            }
            "timeout" => {
                timeout_ms = Some(value.parse().map_err(|_| {
                    ConsensusError::MalformedCommand(format!("bad timeout: {value}"))
                })?);
            }
            "participants" => {
                participants = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(ToString::to_string)
                    .collect();
            }
            "weights" => {
                // weights=alice:3,bob:1
                let mut map = HashMap::new();
                for pair in value.split(',') {
                    let Some((agent, weight)) = pair.split_once(':') else {
                        return Err(ConsensusError::MalformedCommand(format!(
                            "bad weight entry: {pair}"
                        )));
                    };
                    let weight: f64 = weight.parse().map_err(|_| {
                        ConsensusError::MalformedCommand(format!("bad weight: {pair}"))
                    })?;
                    map.insert(agent.trim().to_string(), weight);
                }
                weights = Some(map);
            }
            other => {
                return Err(ConsensusError::MalformedCommand(format!(
                    "unknown option: {other}"
                )));
            }
        }
    }

    if participants.is_empty() {
        return Err(ConsensusError::MalformedCommand(
            "PROPOSE needs participants=a,b,...".into(),
        ));
    }

    Ok(ConsensusCommand::Propose(ProposalRequestParts {
        consensus_type,
        threshold,
        quorum,
        timeout_ms,
        participants,
        weights,
        title: title.to_string(),
        description: description.to_string(),
    }))
}

fn parse_vote(body: &str) -> Result<ConsensusCommand> {
    let mut words = body.split_whitespace();
    words.next(); // VOTE

    let proposal_id = words
        .next()
        .ok_or_else(|| ConsensusError::MalformedCommand("VOTE needs a proposal id".into()))?
        .to_string();
    let value_word = words
        .next()
        .ok_or_else(|| ConsensusError::MalformedCommand("VOTE needs approve|reject|abstain".into()))?;
    let value = VoteValue::parse(value_word).ok_or_else(|| {
        ConsensusError::MalformedCommand(format!("unknown vote value: {value_word}"))
    })?;

    let reason: String = words.collect::<Vec<_>>().join(" ");
    Ok(ConsensusCommand::Vote {
        proposal_id,
        value,
        reason: (!reason.is_empty()).then_some(reason),
    })
}

fn parse_cancel(body: &str) -> Result<ConsensusCommand> {
    let mut words = body.split_whitespace();
    words.next(); // CANCEL
    let proposal_id = words
        .next()
        .ok_or_else(|| ConsensusError::MalformedCommand("CANCEL needs a proposal id".into()))?
        .to_string();
    Ok(ConsensusCommand::Cancel { proposal_id })
}

/// Formats the announcement routed to each participant on creation.
#[must_use]
pub fn format_announcement(proposal: &Proposal) -> String {
    format!(
        "Proposal {id} from {proposer}: {title}\n{description}\n\
         Type: {ctype} | Participants: {participants} | Expires in {timeout}s\n\
         Vote with: VOTE {id} approve|reject|abstain [reason]",
        id = proposal.id,
        proposer = proposal.proposer,
        title = proposal.title,
        description = proposal.description,
        ctype = proposal.consensus_type,
        participants = proposal.participants.join(", "),
        timeout = proposal.timeout_ms / 1000,
    )
}

/// Formats the broadcast result message.
#[must_use]
pub fn format_result(proposal: &Proposal, tally: &Tally) -> String {
    let verdict = match proposal.status {
        ProposalStatus::Approved => "APPROVED",
        ProposalStatus::Rejected => "REJECTED",
        ProposalStatus::NoConsensus => "NO CONSENSUS",
        ProposalStatus::Expired => "EXPIRED",
        ProposalStatus::Cancelled => "CANCELLED",
        ProposalStatus::Pending => "PENDING",
    };
    let mut result = format!(
        "Proposal {id} ({title}) resolved: {verdict}\n\
         Approve: {approve} | Reject: {reject} | Abstain: {abstain}",
        id = proposal.id,
        title = proposal.title,
        approve = tally.approve_weight,
        reject = tally.reject_weight,
        abstain = tally.abstain_count,
    );
    if !tally.non_voters.is_empty() {
        result.push_str(&format!("\nDid not vote: {}", tally.non_voters.join(", ")));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn non_commands_pass_through() {
        assert!(parse_command("hello there").is_none());
        assert!(parse_command("").is_none());
        assert!(parse_command("proposing we do X").is_none());
    }

    #[test]
    fn propose_full_form() {
        let cmd = parse_command(
            "PROPOSE supermajority threshold=0.75 quorum=3 timeout=30000 \
             participants=alice,bob,carol :: Ship v2 :: Cut the release branch",
        )
        .unwrap()
        .unwrap();

        let ConsensusCommand::Propose(parts) = cmd else {
            panic!("expected Propose");
        };
        assert_eq!(parts.consensus_type, ConsensusType::Supermajority);
        assert_eq!(parts.threshold, Some(0.75));
        assert_eq!(parts.quorum, Some(3));
        assert_eq!(parts.timeout_ms, Some(30_000));
        assert_eq!(parts.participants, vec!["alice", "bob", "carol"]);
        assert_eq!(parts.title, "Ship v2");
        assert_eq!(parts.description, "Cut the release branch");
    }

    #[test]
    fn propose_weights() {
        let cmd = parse_command(
            "PROPOSE weighted participants=alice,bob weights=alice:3,bob:1 :: Pick the stack",
        )
        .unwrap()
        .unwrap();

        let ConsensusCommand::Propose(parts) = cmd else {
            panic!("expected Propose");
        };
        let weights = parts.weights.unwrap();
        assert_eq!(weights.get("alice"), Some(&3.0));
        assert_eq!(weights.get("bob"), Some(&1.0));
    }

    #[test]
    fn propose_requires_title_and_participants() {
        assert!(parse_command("PROPOSE majority participants=a,b")
            .unwrap()
            .is_err());
        assert!(parse_command("PROPOSE majority :: A title").unwrap().is_err());
        assert!(parse_command("PROPOSE mystery participants=a :: T")
            .unwrap()
            .is_err());
    }

    #[test]
    fn vote_with_reason() {
        let cmd = parse_command("VOTE abc123 approve ship it already")
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            ConsensusCommand::Vote {
                proposal_id: "abc123".into(),
                value: VoteValue::Approve,
                reason: Some("ship it already".into()),
            }
        );
    }

    #[test]
    fn vote_without_reason() {
        let cmd = parse_command("VOTE abc123 reject").unwrap().unwrap();
        assert_eq!(
            cmd,
            ConsensusCommand::Vote {
                proposal_id: "abc123".into(),
                value: VoteValue::Reject,
                reason: None,
            }
        );
    }

    #[test]
    fn cancel_command() {
        let cmd = parse_command("CANCEL abc123").unwrap().unwrap();
        assert_eq!(
            cmd,
            ConsensusCommand::Cancel {
                proposal_id: "abc123".into()
            }
        );
    }

    #[test]
    fn keyword_is_case_insensitive() {
        assert!(parse_command("vote abc approve").unwrap().is_ok());
        assert!(parse_command("propose majority participants=a :: T")
            .unwrap()
            .is_ok());
    }
}
