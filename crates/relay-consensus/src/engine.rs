//! The consensus engine: proposal lifecycle, auto-resolve, expiry timers.

use crate::error::{ConsensusError, Result};
use crate::proposal::{
    ConsensusType, Proposal, ProposalStatus, Tally, Vote, VoteValue,
};
use crate::DEFAULT_PROPOSAL_TIMEOUT_MS;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Events emitted by the engine. The daemon turns these into routed
/// system messages.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// A proposal was created; announce it to each participant.
    Created {
        /// The new proposal.
        proposal: Proposal,
    },
    /// A proposal reached a final status; broadcast the result.
    Resolved {
        /// The resolved proposal (status is final).
        proposal: Proposal,
        /// The tally at resolution time.
        tally: Tally,
    },
    /// The proposer withdrew the proposal.
    Cancelled {
        /// The cancelled proposal.
        proposal: Proposal,
    },
}

/// Inputs for creating a proposal.
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    /// Short title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// The proposing agent.
    pub proposer: String,
    /// Declared participants.
    pub participants: Vec<String>,
    /// Tally rule.
    pub consensus_type: ConsensusType,
    /// Supermajority threshold override.
    pub threshold: Option<f64>,
    /// Quorum size.
    pub quorum: Option<usize>,
    /// Per-agent weights.
    pub weights: Option<HashMap<String, f64>>,
    /// Voting window; engine default when unset.
    pub timeout_ms: Option<u64>,
}

struct ActiveProposal {
    proposal: Proposal,
    timer: Option<JoinHandle<()>>,
}

/// In-memory proposal table with expiry timers and an event channel.
pub struct ConsensusEngine {
    proposals: Mutex<HashMap<String, ActiveProposal>>,
    events: mpsc::UnboundedSender<ConsensusEvent>,
}

impl ConsensusEngine {
    /// Creates an engine and its event receiver.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConsensusEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                proposals: Mutex::new(HashMap::new()),
                events,
            }),
            rx,
        )
    }

    /// Creates a proposal, starts its expiry timer, and emits `Created`.
    ///
    /// # Errors
    ///
    /// Fails when the request has no participants or an invalid threshold.
    pub fn create_proposal(self: &Arc<Self>, request: ProposalRequest) -> Result<Proposal> {
        if request.participants.is_empty() {
            return Err(ConsensusError::InvalidProposal(
                "a proposal needs at least one participant".into(),
            ));
        }
        if let Some(threshold) = request.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConsensusError::InvalidProposal(format!(
                    "threshold {threshold} outside 0..=1"
                )));
            }
        }

        let id = short_id();
        let now = now_ms();
        let timeout_ms = request.timeout_ms.unwrap_or(DEFAULT_PROPOSAL_TIMEOUT_MS);
        let proposal = Proposal {
            id: id.clone(),
            thread: format!("consensus-{}", slugify(&request.title)),
            title: request.title,
            description: request.description,
            proposer: request.proposer,
            participants: request.participants,
            consensus_type: request.consensus_type,
            threshold: request.threshold,
            quorum: request.quorum,
            weights: request.weights,
            timeout_ms,
            created_at: now,
            expires_at: now + timeout_ms,
            status: ProposalStatus::Pending,
            votes: Vec::new(),
        };

        let timer = {
            let weak: Weak<Self> = Arc::downgrade(self);
            let timer_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if let Some(engine) = weak.upgrade() {
                    engine.expire(&timer_id);
                }
            })
        };

        self.proposals.lock().insert(
            id,
            ActiveProposal {
                proposal: proposal.clone(),
                timer: Some(timer),
            },
        );

        info!(
            proposal = %proposal.id,
            proposer = %proposal.proposer,
            consensus_type = %proposal.consensus_type,
            participants = proposal.participants.len(),
            "proposal created"
        );
        let _ = self.events.send(ConsensusEvent::Created {
            proposal: proposal.clone(),
        });

        // A quorum that can never be met resolves immediately.
        if let Some(status) = proposal.clinched() {
            self.resolve(&proposal.id, status);
        }
        Ok(proposal)
    }

    /// Records (or replaces) a participant's vote and auto-resolves when the
    /// outcome is determined.
    ///
    /// # Errors
    ///
    /// Fails for unknown proposals, resolved proposals, and non-participants.
    pub fn cast_vote(
        &self,
        proposal_id: &str,
        agent: &str,
        value: VoteValue,
        reason: Option<String>,
    ) -> Result<Proposal> {
        let clinched = {
            let mut proposals = self.proposals.lock();
            let entry = proposals
                .get_mut(proposal_id)
                .ok_or_else(|| ConsensusError::UnknownProposal(proposal_id.to_string()))?;

            if entry.proposal.status != ProposalStatus::Pending {
                return Err(ConsensusError::AlreadyResolved {
                    id: proposal_id.to_string(),
                    status: entry.proposal.status.to_string(),
                });
            }
            if !entry.proposal.is_participant(agent) {
                return Err(ConsensusError::NotAParticipant {
                    agent: agent.to_string(),
                    id: proposal_id.to_string(),
                });
            }

            // One active vote per agent: a new vote overwrites.
            entry.proposal.votes.retain(|v| v.agent != agent);
            entry.proposal.votes.push(Vote {
                agent: agent.to_string(),
                value,
                reason,
                ts: now_ms(),
            });
            debug!(proposal = %proposal_id, agent, vote = ?value, "vote recorded");

            entry.proposal.clinched()
        };

        if let Some(status) = clinched {
            self.resolve(proposal_id, status);
        }
        self.get(proposal_id)
            .ok_or_else(|| ConsensusError::UnknownProposal(proposal_id.to_string()))
    }

    /// Cancels a pending proposal; only the proposer may do this.
    ///
    /// # Errors
    ///
    /// Fails for unknown/resolved proposals or non-proposer callers.
    pub fn cancel(&self, proposal_id: &str, agent: &str) -> Result<Proposal> {
        let proposal = {
            let mut proposals = self.proposals.lock();
            let entry = proposals
                .get_mut(proposal_id)
                .ok_or_else(|| ConsensusError::UnknownProposal(proposal_id.to_string()))?;

            if entry.proposal.status != ProposalStatus::Pending {
                return Err(ConsensusError::AlreadyResolved {
                    id: proposal_id.to_string(),
                    status: entry.proposal.status.to_string(),
                });
            }
            if entry.proposal.proposer != agent {
                return Err(ConsensusError::NotTheProposer(proposal_id.to_string()));
            }

            entry.proposal.status = ProposalStatus::Cancelled;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.proposal.clone()
        };

        info!(proposal = %proposal_id, "proposal cancelled");
        let _ = self.events.send(ConsensusEvent::Cancelled {
            proposal: proposal.clone(),
        });
        Ok(proposal)
    }

    /// Fetches a proposal by id.
    #[must_use]
    pub fn get(&self, proposal_id: &str) -> Option<Proposal> {
        self.proposals
            .lock()
            .get(proposal_id)
            .map(|e| e.proposal.clone())
    }

    /// All proposals still accepting votes.
    #[must_use]
    pub fn pending(&self) -> Vec<Proposal> {
        self.proposals
            .lock()
            .values()
            .filter(|e| e.proposal.status == ProposalStatus::Pending)
            .map(|e| e.proposal.clone())
            .collect()
    }

    fn resolve(&self, proposal_id: &str, status: ProposalStatus) {
        let resolved = {
            let mut proposals = self.proposals.lock();
            let Some(entry) = proposals.get_mut(proposal_id) else {
                return;
            };
            if entry.proposal.status != ProposalStatus::Pending {
                return;
            }
            entry.proposal.status = status;
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.proposal.clone()
        };

        info!(proposal = %proposal_id, status = %status, "proposal resolved");
        let tally = resolved.tally();
        let _ = self.events.send(ConsensusEvent::Resolved {
            proposal: resolved,
            tally,
        });
    }

    fn expire(&self, proposal_id: &str) {
        let status = {
            let proposals = self.proposals.lock();
            let Some(entry) = proposals.get(proposal_id) else {
                return;
            };
            if entry.proposal.status != ProposalStatus::Pending {
                return;
            }
            // Resolve with the partial tally; a voteless proposal expires.
            if entry.proposal.tally().votes_cast == 0 {
                ProposalStatus::Expired
            } else {
                entry.proposal.decide()
            }
        };
        self.resolve(proposal_id, status);
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "proposal".to_string()
    } else {
        slug
    }
}
