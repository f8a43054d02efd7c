//! # Relay Consensus
//!
//! Proposal and voting engine for agent fleets. Proposals carry a consensus
//! type (majority, unanimous, supermajority, weighted, quorum), collect
//! votes from declared participants, auto-resolve as soon as the outcome is
//! mathematically determined, and expire on a per-proposal timer.
//!
//! The engine is transport-agnostic: `PROPOSE` / `VOTE` / `CANCEL` commands
//! embedded in message bodies are parsed by [`parse_command`], and results
//! are emitted as [`ConsensusEvent`]s for the daemon to route.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod command;
mod engine;
mod error;
mod proposal;

pub use command::{format_announcement, format_result, parse_command, ConsensusCommand};
pub use engine::{ConsensusEngine, ConsensusEvent, ProposalRequest};
pub use error::{ConsensusError, Result};
pub use proposal::{
    ConsensusType, Proposal, ProposalStatus, Tally, Vote, VoteValue, DEFAULT_SUPERMAJORITY,
};

/// Default proposal timeout when the proposer sets none.
pub const DEFAULT_PROPOSAL_TIMEOUT_MS: u64 = 5 * 60 * 1000;
