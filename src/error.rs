//! Crate-level error types for voting, snapshot fetching, bus dispatch, and
//! hub control.

use crate::domain::ProposalId;

/// Error returned when a voting operation is rejected.
///
/// Every variant is produced before the proposal book is touched, so a
/// rejected operation never leaves a partially applied tally behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    /// No active proposal carries this id.
    ///
    /// Also returned for proposals that have already closed, since a
    /// closed proposal is no longer part of the active set.
    #[error("no active proposal with id `{0}`")]
    NotFound(ProposalId),

    /// A proposal with this id is already active or has already closed.
    #[error("proposal `{0}` already exists")]
    DuplicateProposal(ProposalId),

    /// The proposal's tallies violate `for + against <= total` or
    /// `quorum <= total`.
    #[error(
        "invalid tally for `{id}`: for={votes_for} against={votes_against} \
         quorum={quorum} total={total_votes}"
    )]
    InvalidTally {
        /// Offending proposal.
        id: ProposalId,
        /// Vote weight in favour.
        votes_for: u64,
        /// Vote weight against.
        votes_against: u64,
        /// Quorum threshold.
        quorum: u64,
        /// Denominator for percentages.
        total_votes: u64,
    },

    /// Applying the caller's weight would push participation past the
    /// proposal's total vote weight.
    #[error("vote of weight {weight} on `{id}` exceeds total vote weight {total_votes}")]
    TallyOverflow {
        /// Target proposal.
        id: ProposalId,
        /// Weight the caller tried to apply.
        weight: u64,
        /// Total vote weight of the proposal.
        total_votes: u64,
    },

    /// The voting service task has exited.
    #[error("voting service is no longer running")]
    ServiceGone,
}

/// Error returned when loading an initial snapshot fails.
///
/// Always recoverable: the synchronizer surfaces it as a failed load state
/// and keeps whatever data it already had.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The upstream data source could not serve the request.
    #[error("data source unavailable: {0}")]
    Unavailable(String),

    /// Reading proposals from the voting service failed.
    #[error(transparent)]
    Voting(#[from] VoteError),
}

/// Error returned by [`EventBus::emit`](crate::EventBus::emit).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// Nested emits on this thread went deeper than the cycle guard allows.
    ///
    /// Usually means two subscribers re-emit each other's events forever.
    #[error("emit of `{event}` refused at nesting depth {depth}")]
    EmitDepthExceeded {
        /// Name of the refused event.
        event: &'static str,
        /// Nesting depth at which it was refused.
        depth: usize,
    },
}

/// Error returned by [`Hub`](crate::Hub) construction and generator control.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// [`Hub::start_generator`](crate::Hub::start_generator) was called
    /// while a generator is already running.
    #[error("streaming generator already running")]
    GeneratorRunning,

    /// The seed proposals could not be loaded into the voting service.
    #[error("invalid seed data: {0}")]
    Seed(#[from] VoteError),
}
