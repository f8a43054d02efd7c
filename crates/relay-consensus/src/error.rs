//! Consensus error types.

use thiserror::Error;

/// Errors that can occur in the consensus engine.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The proposal does not exist.
    #[error("unknown proposal: {0}")]
    UnknownProposal(String),

    /// The proposal is no longer accepting votes.
    #[error("proposal {id} already resolved as {status}")]
    AlreadyResolved {
        /// Proposal id.
        id: String,
        /// Final status.
        status: String,
    },

    /// The voter is not a declared participant.
    #[error("{agent} is not a participant of proposal {id}")]
    NotAParticipant {
        /// The voting agent.
        agent: String,
        /// Proposal id.
        id: String,
    },

    /// Someone other than the proposer tried to cancel.
    #[error("only the proposer may cancel proposal {0}")]
    NotTheProposer(String),

    /// The proposal request is invalid.
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// A text command could not be parsed.
    #[error("malformed consensus command: {0}")]
    MalformedCommand(String),
}

/// A specialized Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;
