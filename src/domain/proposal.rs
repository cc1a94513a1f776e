//! Governance proposals, the vote transition, and quorum/result rules.
//!
//! A proposal is `Active` while it sits in the proposal book. Closing it
//! produces an immutable [`PastProposal`] whose result is `Passed` or
//! `Failed`; there is no path back to `Active`.
//!
//! The quorum and outcome rules live in [`Tally`] and are shared by the live
//! progress display and the closing transition.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::VoteError;

/// Opaque, stable proposal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(String);

impl ProposalId {
    /// Create an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProposalId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ProposalId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A vote for or against a proposal. "Not voted" is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    For,
    Against,
}

/// Terminal outcome of a closed proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalResult {
    Passed,
    Failed,
}

/// Running vote totals of a proposal.
///
/// All percentage helpers return `0.0` when their denominator is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    pub votes_for: u64,
    pub votes_against: u64,
    pub quorum: u64,
    pub total_votes: u64,
}

impl Tally {
    /// Combined for + against weight.
    pub fn participation(&self) -> u64 {
        self.votes_for.saturating_add(self.votes_against)
    }

    /// Share of `total_votes` cast in favour, in percent.
    pub fn for_percentage(&self) -> f64 {
        ratio_percent(self.votes_for, self.total_votes)
    }

    /// Share of `total_votes` cast against, in percent.
    pub fn against_percentage(&self) -> f64 {
        ratio_percent(self.votes_against, self.total_votes)
    }

    /// Position of the quorum threshold relative to `total_votes`, in percent.
    pub fn quorum_percentage(&self) -> f64 {
        ratio_percent(self.quorum, self.total_votes)
    }

    /// How far participation has progressed toward quorum, capped at 100.
    ///
    /// A zero quorum is trivially met and reports 100.
    pub fn quorum_progress(&self) -> f64 {
        if self.quorum == 0 {
            return 100.0;
        }
        ratio_percent(self.participation(), self.quorum).min(100.0)
    }

    /// Whether combined participation meets the quorum threshold.
    pub fn quorum_reached(&self) -> bool {
        quorum_reached(self.votes_for, self.votes_against, self.quorum)
    }

    /// The result this proposal would have if it closed right now.
    pub fn outcome(&self) -> ProposalResult {
        decide_outcome(
            self.votes_for,
            self.votes_against,
            self.quorum,
            self.total_votes,
        )
    }

    fn is_consistent(&self) -> bool {
        self.votes_for
            .checked_add(self.votes_against)
            .is_some_and(|p| p <= self.total_votes)
            && self.quorum <= self.total_votes
    }
}

fn ratio_percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Whether `votes_for + votes_against` meets `quorum`.
pub fn quorum_reached(votes_for: u64, votes_against: u64, quorum: u64) -> bool {
    votes_for.saturating_add(votes_against) >= quorum
}

/// Decide the result of a proposal closing with the given tallies.
///
/// A proposal passes only if quorum is reached *and* strictly more weight is
/// for than against. Missing quorum fails the proposal whatever the ratio.
/// `total_votes` does not influence the decision; it is accepted so callers
/// can pass a full [`Tally`] worth of numbers without picking fields apart.
pub fn decide_outcome(
    votes_for: u64,
    votes_against: u64,
    quorum: u64,
    _total_votes: u64,
) -> ProposalResult {
    if quorum_reached(votes_for, votes_against, quorum) && votes_for > votes_against {
        ProposalResult::Passed
    } else {
        ProposalResult::Failed
    }
}

/// A governance proposal open for voting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: ProposalId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub votes_for: u64,
    pub votes_against: u64,
    pub total_votes: u64,
    pub quorum: u64,
    /// Seconds until voting ends. Only ever counts down.
    pub time_remaining_secs: u64,
    pub your_vote: Option<VoteChoice>,
    /// Weight the caller's current vote contributes; `0` when not voted.
    #[serde(default)]
    pub your_weight: u64,
    /// Position of the last change in the owning book's sequence.
    ///
    /// Consumers merging snapshots from different moments keep the
    /// higher version.
    #[serde(default)]
    pub version: u64,
}

impl Proposal {
    /// Create a proposal with no votes cast.
    pub fn new(
        id: impl Into<ProposalId>,
        title: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            category: category.into(),
            votes_for: 0,
            votes_against: 0,
            total_votes: 0,
            quorum: 0,
            time_remaining_secs: 0,
            your_vote: None,
            your_weight: 0,
            version: 0,
        }
    }

    /// Set the initial tallies.
    pub fn with_tally(
        mut self,
        votes_for: u64,
        votes_against: u64,
        quorum: u64,
        total_votes: u64,
    ) -> Self {
        self.votes_for = votes_for;
        self.votes_against = votes_against;
        self.quorum = quorum;
        self.total_votes = total_votes;
        self
    }

    /// Set the voting window.
    pub fn with_time_remaining(mut self, secs: u64) -> Self {
        self.time_remaining_secs = secs;
        self
    }

    pub fn tally(&self) -> Tally {
        Tally {
            votes_for: self.votes_for,
            votes_against: self.votes_against,
            quorum: self.quorum,
            total_votes: self.total_votes,
        }
    }

    /// Check the tally invariants.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError::InvalidTally`] if `for + against > total` or
    /// `quorum > total`.
    pub fn validate(&self) -> Result<(), VoteError> {
        if self.tally().is_consistent() {
            Ok(())
        } else {
            Err(VoteError::InvalidTally {
                id: self.id.clone(),
                votes_for: self.votes_for,
                votes_against: self.votes_against,
                quorum: self.quorum,
                total_votes: self.total_votes,
            })
        }
    }

    /// Apply the caller's vote, replacing any vote they cast before.
    ///
    /// The prior contribution is reversed before `weight` is applied to the
    /// new side, so re-casting the same choice leaves the tallies unchanged
    /// and `None` restores the tallies from before the caller's first vote.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError::TallyOverflow`] if the new participation would
    /// exceed `total_votes`. The proposal is left untouched in that case.
    pub fn apply_vote(&mut self, choice: Option<VoteChoice>, weight: u64) -> Result<(), VoteError> {
        let mut votes_for = self.votes_for;
        let mut votes_against = self.votes_against;

        match self.your_vote {
            Some(VoteChoice::For) => votes_for = votes_for.saturating_sub(self.your_weight),
            Some(VoteChoice::Against) => {
                votes_against = votes_against.saturating_sub(self.your_weight)
            }
            None => {}
        }

        let overflow = || VoteError::TallyOverflow {
            id: self.id.clone(),
            weight,
            total_votes: self.total_votes,
        };

        match choice {
            Some(VoteChoice::For) => {
                votes_for = votes_for.checked_add(weight).ok_or_else(overflow)?
            }
            Some(VoteChoice::Against) => {
                votes_against = votes_against.checked_add(weight).ok_or_else(overflow)?
            }
            None => {}
        }

        let participation = votes_for.checked_add(votes_against).ok_or_else(overflow)?;
        if participation > self.total_votes {
            return Err(overflow());
        }

        self.votes_for = votes_for;
        self.votes_against = votes_against;
        self.your_vote = choice;
        self.your_weight = if choice.is_some() { weight } else { 0 };
        Ok(())
    }

    /// Add weight cast by other participants, capped at the remaining
    /// headroom under `total_votes`.
    ///
    /// The caller's own vote is untouched. Returns the weight actually
    /// added, which is `0` when the proposal is already fully voted.
    pub fn record_outside_votes(&mut self, choice: VoteChoice, weight: u64) -> u64 {
        let headroom = self
            .total_votes
            .saturating_sub(self.tally().participation());
        let added = weight.min(headroom);
        match choice {
            VoteChoice::For => self.votes_for += added,
            VoteChoice::Against => self.votes_against += added,
        }
        added
    }

    /// Count the voting window down by `elapsed_secs`, stopping at zero.
    ///
    /// Returns `true` if the countdown changed.
    pub fn count_down(&mut self, elapsed_secs: u64) -> bool {
        let next = self.time_remaining_secs.saturating_sub(elapsed_secs);
        let changed = next != self.time_remaining_secs;
        self.time_remaining_secs = next;
        changed
    }

    pub fn has_ended(&self) -> bool {
        self.time_remaining_secs == 0
    }

    /// Human-readable countdown, e.g. `"2d 4h"`, `"3h 12m"`, `"45s"`.
    pub fn time_remaining_label(&self) -> String {
        let secs = self.time_remaining_secs;
        let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3_600, (secs % 3_600) / 60);
        match secs {
            0 => "Ended".to_string(),
            s if s >= 86_400 => format!("{days}d {hours}h"),
            s if s >= 3_600 => format!("{hours}h {minutes}m"),
            s if s >= 60 => format!("{minutes}m {}s", s % 60),
            s => format!("{s}s"),
        }
    }

    /// Freeze this proposal into its closed form.
    ///
    /// The result comes from [`Tally::outcome`], the same rule the live
    /// progress display uses.
    pub fn close(&self, date: NaiveDate) -> PastProposal {
        PastProposal {
            id: self.id.clone(),
            title: self.title.clone(),
            result: self.tally().outcome(),
            your_vote: self.your_vote,
            category: self.category.clone(),
            date,
        }
    }
}

/// A closed proposal. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PastProposal {
    pub id: ProposalId,
    pub title: String,
    pub result: ProposalResult,
    pub your_vote: Option<VoteChoice>,
    pub category: String,
    pub date: NaiveDate,
}
