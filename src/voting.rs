//! The authoritative proposal book and the actor that owns it.
//!
//! [`ProposalBook`] is plain state with synchronous operations; every
//! operation validates before it mutates. [`VotingService`] is a cloneable
//! async handle to a task that exclusively owns one book and processes
//! requests sequentially over an `mpsc` channel, so votes, generator
//! updates, and closes never interleave inside a single operation.

use chrono::{NaiveDate, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::domain::{PastProposal, Proposal, ProposalId, VoteChoice};
use crate::error::VoteError;

/// Active and closed proposals.
///
/// Active proposals keep insertion order. Past proposals are kept most
/// recent first. Every mutation of an active proposal stamps it with the
/// next value of the book's version sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProposalBook {
    active: Vec<Proposal>,
    past: Vec<PastProposal>,
    version: u64,
}

impl ProposalBook {
    /// Build a book from seed data.
    ///
    /// # Errors
    ///
    /// * [`VoteError::InvalidTally`] -- a seed proposal violates the tally
    ///   invariants.
    /// * [`VoteError::DuplicateProposal`] -- two seeds share an id.
    pub fn new(active: Vec<Proposal>, past: Vec<PastProposal>) -> Result<Self, VoteError> {
        let mut book = Self {
            active: Vec::with_capacity(active.len()),
            past,
            version: 0,
        };
        for proposal in active {
            book.open(proposal)?;
        }
        Ok(book)
    }

    pub fn active(&self) -> &[Proposal] {
        &self.active
    }

    pub fn past(&self) -> &[PastProposal] {
        &self.past
    }

    pub fn get(&self, id: &ProposalId) -> Option<&Proposal> {
        self.active.iter().find(|p| &p.id == id)
    }

    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn position(&self, id: &ProposalId) -> Result<usize, VoteError> {
        self.active
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| VoteError::NotFound(id.clone()))
    }

    /// Apply the caller's vote and return the full active collection.
    ///
    /// # Errors
    ///
    /// * [`VoteError::NotFound`] -- `id` is not an active proposal.
    /// * [`VoteError::TallyOverflow`] -- the vote would exceed the
    ///   proposal's total vote weight.
    pub fn submit_vote(
        &mut self,
        id: &ProposalId,
        choice: Option<VoteChoice>,
        weight: u64,
    ) -> Result<&[Proposal], VoteError> {
        let index = self.position(id)?;
        self.active[index].apply_vote(choice, weight)?;
        self.active[index].version = self.next_version();
        tracing::debug!(proposal_id = %id, ?choice, weight, "vote applied");
        Ok(&self.active)
    }

    /// Admit a new active proposal.
    ///
    /// # Errors
    ///
    /// * [`VoteError::DuplicateProposal`] -- the id is already active or
    ///   already closed. Closed proposals never reopen.
    /// * [`VoteError::InvalidTally`] -- the tallies are inconsistent.
    pub fn open(&mut self, proposal: Proposal) -> Result<(), VoteError> {
        if self.get(&proposal.id).is_some() || self.past.iter().any(|p| p.id == proposal.id) {
            return Err(VoteError::DuplicateProposal(proposal.id));
        }
        proposal.validate()?;
        // Later changes must outrank whatever version the proposal arrived with.
        self.version = self.version.max(proposal.version);
        self.active.push(proposal);
        Ok(())
    }

    /// Replace the tallies and countdown of an active proposal.
    ///
    /// Title, description, category, and the caller's own vote are kept
    /// from the existing record. The countdown never moves backwards.
    ///
    /// # Errors
    ///
    /// * [`VoteError::NotFound`] -- `update.id` is not active.
    /// * [`VoteError::InvalidTally`] -- the merged record is inconsistent.
    pub fn update(&mut self, update: Proposal) -> Result<Proposal, VoteError> {
        let index = self.position(&update.id)?;
        let current = &self.active[index];
        let mut merged = Proposal {
            votes_for: update.votes_for,
            votes_against: update.votes_against,
            total_votes: update.total_votes,
            quorum: update.quorum,
            time_remaining_secs: update.time_remaining_secs.min(current.time_remaining_secs),
            ..current.clone()
        };
        merged.validate()?;
        merged.version = self.next_version();
        self.active[index] = merged.clone();
        Ok(merged)
    }

    /// Count every active proposal down by `elapsed_secs`.
    ///
    /// Returns the proposals whose countdown changed.
    pub fn tick(&mut self, elapsed_secs: u64) -> Vec<Proposal> {
        let mut version = self.version;
        let changed = self
            .active
            .iter_mut()
            .filter_map(|p| p.count_down(elapsed_secs).then_some(p))
            .map(|p| {
                version += 1;
                p.version = version;
                p.clone()
            })
            .collect();
        self.version = version;
        changed
    }

    /// Add weight cast by other participants to an active proposal.
    ///
    /// The weight is capped at the proposal's remaining headroom, checked
    /// against its tallies at the moment of the call. Returns the updated
    /// proposal, or `None` if nothing could be added.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError::NotFound`] if `id` is not active.
    pub fn record_outside_votes(
        &mut self,
        id: &ProposalId,
        choice: VoteChoice,
        weight: u64,
    ) -> Result<Option<Proposal>, VoteError> {
        let index = self.position(id)?;
        if self.active[index].record_outside_votes(choice, weight) == 0 {
            return Ok(None);
        }
        self.active[index].version = self.next_version();
        Ok(Some(self.active[index].clone()))
    }

    /// Ids of active proposals whose voting window has ended.
    pub fn due(&self) -> Vec<ProposalId> {
        self.active
            .iter()
            .filter(|p| p.has_ended())
            .map(|p| p.id.clone())
            .collect()
    }

    /// Close an active proposal, deciding its result from the current tally.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError::NotFound`] if `id` is not active.
    pub fn close(&mut self, id: &ProposalId, date: NaiveDate) -> Result<PastProposal, VoteError> {
        let index = self.position(id)?;
        let _span = tracing::info_span!("close_proposal", proposal_id = %id).entered();
        let proposal = self.active.remove(index);
        let past = proposal.close(date);
        tracing::info!(
            result = ?past.result,
            votes_for = proposal.votes_for,
            votes_against = proposal.votes_against,
            quorum = proposal.quorum,
            "proposal closed"
        );
        self.past.insert(0, past.clone());
        Ok(past)
    }
}

/// Configuration for the voting service.
#[derive(Debug, Clone)]
pub struct VotingConfig {
    /// Weight applied by [`VotingService::submit_vote`] on behalf of the
    /// caller.
    ///
    /// Default: 1.
    pub vote_weight: u64,

    /// Capacity of the request channel.
    ///
    /// Default: 64.
    pub mailbox: usize,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            vote_weight: 1,
            mailbox: 64,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, VoteError>>;

/// Requests sent from [`VotingService`] to the owning task.
enum VotingMessage {
    SubmitVote {
        id: ProposalId,
        choice: Option<VoteChoice>,
        reply: Reply<Vec<Proposal>>,
    },
    Active {
        reply: oneshot::Sender<Vec<Proposal>>,
    },
    Past {
        reply: oneshot::Sender<Vec<PastProposal>>,
    },
    Open {
        proposal: Proposal,
        reply: Reply<()>,
    },
    Update {
        proposal: Proposal,
        reply: Reply<Proposal>,
    },
    Tick {
        elapsed_secs: u64,
        reply: oneshot::Sender<Vec<Proposal>>,
    },
    RecordOutsideVotes {
        id: ProposalId,
        choice: VoteChoice,
        weight: u64,
        reply: Reply<Option<Proposal>>,
    },
    Close {
        id: ProposalId,
        reply: Reply<PastProposal>,
    },
    Shutdown,
}

async fn run_voting_service(
    mut book: ProposalBook,
    mut rx: mpsc::Receiver<VotingMessage>,
    config: VotingConfig,
) {
    while let Some(msg) = rx.recv().await {
        // A dropped reply receiver means the caller stopped waiting;
        // the operation has still been applied.
        match msg {
            VotingMessage::SubmitVote { id, choice, reply } => {
                let result = book
                    .submit_vote(&id, choice, config.vote_weight)
                    .map(<[Proposal]>::to_vec);
                if let Err(e) = &result {
                    tracing::debug!(proposal_id = %id, error = %e, "vote rejected");
                }
                let _ = reply.send(result);
            }
            VotingMessage::Active { reply } => {
                let _ = reply.send(book.active().to_vec());
            }
            VotingMessage::Past { reply } => {
                let _ = reply.send(book.past().to_vec());
            }
            VotingMessage::Open { proposal, reply } => {
                let id = proposal.id.clone();
                let result = book.open(proposal);
                if result.is_ok() {
                    tracing::info!(proposal_id = %id, "proposal opened");
                }
                let _ = reply.send(result);
            }
            VotingMessage::Update { proposal, reply } => {
                let _ = reply.send(book.update(proposal));
            }
            VotingMessage::Tick {
                elapsed_secs,
                reply,
            } => {
                let _ = reply.send(book.tick(elapsed_secs));
            }
            VotingMessage::RecordOutsideVotes {
                id,
                choice,
                weight,
                reply,
            } => {
                let _ = reply.send(book.record_outside_votes(&id, choice, weight));
            }
            VotingMessage::Close { id, reply } => {
                let _ = reply.send(book.close(&id, Utc::now().date_naive()));
            }
            VotingMessage::Shutdown => break,
        }
    }
    tracing::debug!("voting service stopped");
}

/// Async handle to the task that owns the [`ProposalBook`].
///
/// Cheap to clone. All methods fail with [`VoteError::ServiceGone`] once
/// the task has stopped.
#[derive(Debug, Clone)]
pub struct VotingService {
    sender: mpsc::Sender<VotingMessage>,
}

/// Spawn the voting task on the current tokio runtime.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub fn spawn_voting_service(book: ProposalBook, config: VotingConfig) -> VotingService {
    let (sender, rx) = mpsc::channel(config.mailbox.max(1));
    tracing::info!(
        active = book.active().len(),
        past = book.past().len(),
        vote_weight = config.vote_weight,
        "voting service started"
    );
    tokio::spawn(run_voting_service(book, rx, config));
    VotingService { sender }
}

impl VotingService {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> VotingMessage,
    ) -> Result<T, VoteError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| VoteError::ServiceGone)?;
        rx.await.map_err(|_| VoteError::ServiceGone)
    }

    /// Cast, change, or (with `None`) remove the caller's vote.
    ///
    /// Returns the full active collection after the vote.
    ///
    /// # Errors
    ///
    /// * [`VoteError::NotFound`] -- no active proposal has this id.
    /// * [`VoteError::TallyOverflow`] -- the vote would exceed total weight.
    /// * [`VoteError::ServiceGone`] -- the task has stopped.
    pub async fn submit_vote(
        &self,
        id: impl Into<ProposalId>,
        choice: Option<VoteChoice>,
    ) -> Result<Vec<Proposal>, VoteError> {
        let id = id.into();
        self.request(|reply| VotingMessage::SubmitVote { id, choice, reply })
            .await?
    }

    /// Snapshot of the active proposals.
    pub async fn active_proposals(&self) -> Result<Vec<Proposal>, VoteError> {
        self.request(|reply| VotingMessage::Active { reply }).await
    }

    /// Snapshot of the closed proposals, most recent first.
    pub async fn past_proposals(&self) -> Result<Vec<PastProposal>, VoteError> {
        self.request(|reply| VotingMessage::Past { reply }).await
    }

    /// Admit a new proposal. See [`ProposalBook::open`].
    pub async fn open_proposal(&self, proposal: Proposal) -> Result<(), VoteError> {
        self.request(|reply| VotingMessage::Open { proposal, reply })
            .await?
    }

    /// Merge new tallies into an active proposal. See [`ProposalBook::update`].
    pub async fn update_proposal(&self, proposal: Proposal) -> Result<Proposal, VoteError> {
        self.request(|reply| VotingMessage::Update { proposal, reply })
            .await?
    }

    /// Count every active proposal down. See [`ProposalBook::tick`].
    pub async fn tick(&self, elapsed_secs: u64) -> Result<Vec<Proposal>, VoteError> {
        self.request(|reply| VotingMessage::Tick {
            elapsed_secs,
            reply,
        })
        .await
    }

    /// Add other participants' weight in one step. See
    /// [`ProposalBook::record_outside_votes`].
    pub async fn record_outside_votes(
        &self,
        id: impl Into<ProposalId>,
        choice: VoteChoice,
        weight: u64,
    ) -> Result<Option<Proposal>, VoteError> {
        let id = id.into();
        self.request(|reply| VotingMessage::RecordOutsideVotes {
            id,
            choice,
            weight,
            reply,
        })
        .await?
    }

    /// Close an active proposal as of today. See [`ProposalBook::close`].
    pub async fn close_proposal(
        &self,
        id: impl Into<ProposalId>,
    ) -> Result<PastProposal, VoteError> {
        let id = id.into();
        self.request(|reply| VotingMessage::Close { id, reply })
            .await?
    }

    /// Ask the task to stop after the requests already queued.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(VotingMessage::Shutdown).await;
    }

    /// Whether the owning task is still accepting requests.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProposalResult;

    fn proposal(id: &str, votes_for: u64, votes_against: u64, quorum: u64) -> Proposal {
        Proposal::new(id, format!("Proposal {id}"), "details", "Treasury")
            .with_tally(votes_for, votes_against, quorum, 1_000)
            .with_time_remaining(120)
    }

    fn book() -> ProposalBook {
        ProposalBook::new(
            vec![proposal("p-1", 100, 50, 120), proposal("p-2", 10, 0, 500)],
            vec![],
        )
        .unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    #[test]
    fn submit_vote_returns_whole_collection() {
        let mut book = book();
        let all = book
            .submit_vote(&"p-1".into(), Some(VoteChoice::For), 30)
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].votes_for, 130);
        assert_eq!(all[1], proposal("p-2", 10, 0, 500));
    }

    #[test]
    fn unknown_proposal_is_rejected_without_mutation() {
        let mut book = book();
        let before = book.clone();
        let err = book
            .submit_vote(&"nope".into(), Some(VoteChoice::For), 1)
            .unwrap_err();
        assert_eq!(err, VoteError::NotFound("nope".into()));
        assert_eq!(book, before);
    }

    #[test]
    fn seeding_rejects_duplicates_and_bad_tallies() {
        let dup = ProposalBook::new(vec![proposal("a", 0, 0, 0), proposal("a", 0, 0, 0)], vec![]);
        assert_eq!(dup.unwrap_err(), VoteError::DuplicateProposal("a".into()));

        let bad = ProposalBook::new(vec![proposal("b", 900, 200, 0)], vec![]);
        assert!(matches!(bad.unwrap_err(), VoteError::InvalidTally { .. }));
    }

    #[test]
    fn close_moves_proposal_to_past_with_shared_rule() {
        let mut book = book();
        book.submit_vote(&"p-1".into(), Some(VoteChoice::For), 30)
            .unwrap();
        let past = book.close(&"p-1".into(), today()).unwrap();
        assert_eq!(past.result, ProposalResult::Passed);
        assert_eq!(book.active().len(), 1);
        assert_eq!(book.past()[0], past);

        // p-2 has a clear majority but misses quorum.
        let past = book.close(&"p-2".into(), today()).unwrap();
        assert_eq!(past.result, ProposalResult::Failed);
        assert_eq!(book.past()[0].id, ProposalId::from("p-2"));
    }

    #[test]
    fn closed_proposal_cannot_be_voted_or_reopened() {
        let mut book = book();
        book.close(&"p-1".into(), today()).unwrap();
        assert_eq!(
            book.submit_vote(&"p-1".into(), Some(VoteChoice::For), 1)
                .unwrap_err(),
            VoteError::NotFound("p-1".into())
        );
        assert_eq!(
            book.open(proposal("p-1", 0, 0, 0)).unwrap_err(),
            VoteError::DuplicateProposal("p-1".into())
        );
    }

    #[test]
    fn update_keeps_identity_and_caller_vote() {
        let mut book = book();
        book.submit_vote(&"p-1".into(), Some(VoteChoice::Against), 5)
            .unwrap();

        let mut incoming = proposal("p-1", 200, 80, 120).with_time_remaining(500);
        incoming.title = "renamed".into();
        let merged = book.update(incoming).unwrap();

        assert_eq!(merged.title, "Proposal p-1");
        assert_eq!(merged.votes_for, 200);
        assert_eq!(merged.your_vote, Some(VoteChoice::Against));
        // Countdown never moves backwards.
        assert_eq!(merged.time_remaining_secs, 120);
    }

    #[test]
    fn tick_reports_changed_and_due_proposals() {
        let mut book = book();
        book.open(proposal("p-3", 0, 0, 0).with_time_remaining(5))
            .unwrap();
        let changed = book.tick(10);
        assert_eq!(changed.len(), 3);
        assert_eq!(book.due(), vec![ProposalId::from("p-3")]);

        // Already at zero: no longer reported as changed.
        book.tick(200);
        assert_eq!(book.tick(1).len(), 0);
    }

    #[test]
    fn mutations_advance_the_version() {
        let mut book = book();
        let voted = book.submit_vote(&"p-1".into(), Some(VoteChoice::For), 1).unwrap()[0].version;
        let ticked = book.tick(1);
        assert!(ticked.iter().all(|p| p.version > voted));
        let outside = book
            .record_outside_votes(&"p-2".into(), VoteChoice::Against, 3)
            .unwrap()
            .unwrap();
        assert!(outside.version > ticked[1].version);
    }

    #[test]
    fn versions_continue_past_seeded_ones() {
        let mut seeded = proposal("p-9", 0, 0, 10);
        seeded.version = 40;
        let mut book = ProposalBook::new(vec![seeded], vec![]).unwrap();
        let all = book.submit_vote(&"p-9".into(), Some(VoteChoice::For), 1).unwrap();
        assert_eq!(all[0].version, 41);
    }

    #[test]
    fn outside_votes_keep_a_vote_cast_after_the_snapshot() {
        let mut book = book();
        let snapshot = book.active().to_vec();

        book.submit_vote(&"p-1".into(), Some(VoteChoice::For), 30)
            .unwrap();
        let updated = book
            .record_outside_votes(&snapshot[0].id, VoteChoice::For, 4)
            .unwrap()
            .unwrap();
        assert_eq!((updated.votes_for, updated.votes_against), (134, 50));

        let all = book.submit_vote(&"p-1".into(), None, 30).unwrap();
        assert_eq!((all[0].votes_for, all[0].votes_against), (104, 50));
    }

    #[test]
    fn outside_votes_stop_at_total_weight() {
        let mut book = ProposalBook::new(vec![proposal("full", 600, 400, 10)], vec![]).unwrap();
        let before = book.clone();
        assert_eq!(
            book.record_outside_votes(&"full".into(), VoteChoice::For, 1),
            Ok(None)
        );
        assert_eq!(book, before);
        assert_eq!(
            book.record_outside_votes(&"nope".into(), VoteChoice::For, 1)
                .unwrap_err(),
            VoteError::NotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn service_applies_configured_weight() {
        let service = spawn_voting_service(
            book(),
            VotingConfig {
                vote_weight: 30,
                ..VotingConfig::default()
            },
        );
        let updated = service
            .submit_vote("p-1", Some(VoteChoice::For))
            .await
            .unwrap();
        assert_eq!(updated[0].votes_for, 130);
        assert!(updated[0].tally().quorum_reached());

        let past = service.close_proposal("p-1").await.unwrap();
        assert_eq!(past.result, ProposalResult::Passed);
        assert_eq!(service.past_proposals().await.unwrap(), vec![past]);
    }

    #[tokio::test]
    async fn service_revote_and_removal() {
        let service = spawn_voting_service(book(), VotingConfig::default());
        service.submit_vote("p-1", Some(VoteChoice::For)).await.unwrap();
        service.submit_vote("p-1", Some(VoteChoice::For)).await.unwrap();
        let after = service
            .submit_vote("p-1", Some(VoteChoice::Against))
            .await
            .unwrap();
        assert_eq!((after[0].votes_for, after[0].votes_against), (100, 51));

        let after = service.submit_vote("p-1", None).await.unwrap();
        assert_eq!((after[0].votes_for, after[0].votes_against), (100, 50));
    }

    #[tokio::test]
    async fn service_interleaved_outside_votes_and_removal() {
        let service = spawn_voting_service(
            book(),
            VotingConfig {
                vote_weight: 30,
                ..VotingConfig::default()
            },
        );
        let snapshot = service.active_proposals().await.unwrap();
        service.submit_vote("p-1", Some(VoteChoice::For)).await.unwrap();
        service
            .record_outside_votes(snapshot[0].id.clone(), VoteChoice::For, 4)
            .await
            .unwrap();
        let after = service.submit_vote("p-1", None).await.unwrap();
        assert_eq!((after[0].votes_for, after[0].votes_against), (104, 50));
        assert_eq!(after[0].your_weight, 0);
    }

    #[tokio::test]
    async fn service_reads_do_not_mutate() {
        let service = spawn_voting_service(book(), VotingConfig::default());
        let first = service.active_proposals().await.unwrap();
        let second = service.active_proposals().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stopped_service_reports_gone() {
        let service = spawn_voting_service(book(), VotingConfig::default());
        service.shutdown().await;
        // Wait for the task to drain and drop its receiver.
        while service.is_alive() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            service.active_proposals().await.unwrap_err(),
            VoteError::ServiceGone
        );
    }
}
