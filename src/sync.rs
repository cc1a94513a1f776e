//! Reactive state synchronizer.
//!
//! A [`Synchronizer`] bridges the bus to read-only observers. On mount it
//! subscribes to every catalogue event and fetches an initial snapshot from
//! a [`DataSource`]. Incoming events are merged through the pure [`reduce`]
//! function and published as a fresh [`DashboardState`] on a `watch`
//! channel. Slices an event does not touch keep their `Arc`, so observers
//! can detect changes with [`Arc::ptr_eq`].
//!
//! Events that arrive before the snapshot has loaded are buffered and
//! replayed on top of it. The buffer keeps only the latest event of each
//! kind that carries a full value, and at most [`MAX_PENDING`] events.
//!
//! Proposal payloads carry the voting book's version. An incoming copy
//! replaces a shown proposal only if it is at least as new, and vote
//! results never add or remove proposals.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::bus::{BusEvent, Subscription};
use crate::domain::{
    DashboardOverview, DashboardPerformance, PastProposal, Proposal, ProposalId, VoteChoice,
};
use crate::error::{FetchError, VoteError};
use crate::events::{
    AssetPerformanceChanged, DashboardBus, DashboardEvents, NewProposal, PerformanceDataUpdated,
    PortfolioValueUpdated, ProposalClosed, ProposalUpdated, RiskScoreChanged, VoteSubmitted,
    WireEvent,
};
use crate::source::DataSource;
use crate::voting::VotingService;

/// Load lifecycle of a synchronizer's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loading,
    Ready,
    Failed,
}

/// Immutable read model published to observers.
///
/// A slice is `None` until the first successful fetch. After a failed
/// refetch the last good slices are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardState {
    pub status: LoadStatus,
    /// User-facing message for the last failed fetch.
    pub error: Option<String>,
    pub active_proposals: Option<Arc<Vec<Proposal>>>,
    pub past_proposals: Option<Arc<Vec<PastProposal>>>,
    pub overview: Option<Arc<DashboardOverview>>,
    pub performance: Option<Arc<DashboardPerformance>>,
}

impl Default for DashboardState {
    fn default() -> Self {
        Self {
            status: LoadStatus::Loading,
            error: None,
            active_proposals: None,
            past_proposals: None,
            overview: None,
            performance: None,
        }
    }
}

impl DashboardState {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            status: LoadStatus::Ready,
            error: None,
            active_proposals: Some(Arc::new(snapshot.active)),
            past_proposals: Some(Arc::new(snapshot.past)),
            overview: Some(Arc::new(snapshot.overview)),
            performance: Some(Arc::new(snapshot.performance)),
        }
    }

    /// Whether any slice holds data.
    pub fn has_data(&self) -> bool {
        self.active_proposals.is_some()
            || self.past_proposals.is_some()
            || self.overview.is_some()
            || self.performance.is_some()
    }

    pub fn proposal(&self, id: &ProposalId) -> Option<&Proposal> {
        self.active_proposals
            .as_deref()
            .and_then(|active| active.iter().find(|p| &p.id == id))
    }
}

/// Events a synchronizer consumes: the whole catalogue.
pub type SyncEvent = WireEvent;

fn with_overview(
    state: &DashboardState,
    edit: impl FnOnce(&mut DashboardOverview),
) -> DashboardState {
    let mut next = state.clone();
    if let Some(overview) = &state.overview {
        let mut overview = DashboardOverview::clone(overview);
        edit(&mut overview);
        next.overview = Some(Arc::new(overview));
    }
    next
}

fn with_active(state: &DashboardState, edit: impl FnOnce(&mut Vec<Proposal>)) -> DashboardState {
    let mut next = state.clone();
    if let Some(active) = &state.active_proposals {
        let mut active = Vec::clone(active);
        edit(&mut active);
        next.active_proposals = Some(Arc::new(active));
    }
    next
}

/// Merge one event into `state`, returning the next state.
///
/// Never mutates `state`. Only the slices the event touches get new
/// allocations; every other slice is shared with `state`. Events touching
/// a slice that has not loaded are ignored.
pub fn reduce(state: &DashboardState, event: &SyncEvent) -> DashboardState {
    match event {
        WireEvent::PortfolioValueUpdated(e) => with_overview(state, |o| {
            o.portfolio.value = e.portfolio_value;
            o.portfolio.percentage_change = e.percentage_change;
            o.portfolio.last_updated = e.last_updated;
        }),
        WireEvent::RiskScoreChanged(e) => with_overview(state, |o| o.risk = e.score),
        WireEvent::AssetPerformanceChanged(e) => with_overview(state, |o| {
            o.top_performers = e.top_performers.clone();
            o.underperformers = e.underperformers.clone();
        }),
        WireEvent::PerformanceDataUpdated(e) => {
            let mut next = state.clone();
            if state.performance.is_some() {
                next.performance = Some(Arc::new(DashboardPerformance {
                    historical_performance: e.historical_performance.clone(),
                }));
            }
            next
        }
        WireEvent::VoteSubmitted(e) => with_active(state, |active| {
            for current in active.iter_mut() {
                if let Some(incoming) = e.updated_proposals.iter().find(|p| p.id == current.id)
                    && incoming.version >= current.version
                {
                    current.clone_from(incoming);
                }
            }
        }),
        WireEvent::ProposalUpdated(e) => {
            if state
                .proposal(&e.proposal.id)
                .is_none_or(|current| current.version > e.proposal.version)
            {
                return state.clone();
            }
            with_active(state, |active| {
                for p in active.iter_mut().filter(|p| p.id == e.proposal.id) {
                    p.clone_from(&e.proposal);
                }
            })
        }
        WireEvent::NewProposal(e) => {
            if state.proposal(&e.proposal.id).is_some() {
                return state.clone();
            }
            with_active(state, |active| active.push(e.proposal.clone()))
        }
        WireEvent::ProposalClosed(e) => {
            let mut next = with_active(state, |active| active.retain(|p| p.id != e.proposal_id));
            if let Some(past) = &state.past_proposals
                && !past.iter().any(|p| p.id == e.past_proposal.id)
            {
                let mut past = Vec::clone(past);
                past.insert(0, e.past_proposal.clone());
                next.past_proposals = Some(Arc::new(past));
            }
            next
        }
    }
}

struct Snapshot {
    active: Vec<Proposal>,
    past: Vec<PastProposal>,
    overview: DashboardOverview,
    performance: DashboardPerformance,
}

async fn fetch_snapshot(source: &dyn DataSource) -> Result<Snapshot, FetchError> {
    let (active, past, overview, performance) = tokio::try_join!(
        source.active_proposals(),
        source.past_proposals(),
        source.dashboard_overview(),
        source.dashboard_performance(),
    )?;
    Ok(Snapshot {
        active,
        past,
        overview,
        performance,
    })
}

/// Most events a synchronizer buffers while it has no snapshot.
pub const MAX_PENDING: usize = 256;

/// Whether `later` makes `earlier` redundant in the replay buffer.
///
/// Proposal openings and closings are never superseded.
fn supersedes(later: &SyncEvent, earlier: &SyncEvent) -> bool {
    match (later, earlier) {
        (WireEvent::ProposalUpdated(a), WireEvent::ProposalUpdated(b)) => {
            a.proposal.id == b.proposal.id
        }
        (WireEvent::NewProposal(_) | WireEvent::ProposalClosed(_), _) => false,
        _ => later.name() == earlier.name(),
    }
}

/// Bookkeeping guarded by one lock so event delivery and fetch completion
/// never interleave.
struct Inner {
    mounted: bool,
    /// Events apply directly only while set; otherwise they are buffered.
    live: bool,
    generation: u64,
    pending: VecDeque<SyncEvent>,
}

impl Inner {
    fn buffer(&mut self, event: SyncEvent) {
        self.pending.retain(|earlier| !supersedes(&event, earlier));
        if self.pending.len() >= MAX_PENDING
            && let Some(dropped) = self.pending.pop_front()
        {
            tracing::warn!(
                dropped = dropped.name(),
                limit = MAX_PENDING,
                "replay buffer full, dropping oldest event"
            );
        }
        tracing::debug!(event = event.name(), "buffering event until snapshot loads");
        self.pending.push_back(event);
    }
}

struct Shared {
    state: watch::Sender<Arc<DashboardState>>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Arc<DashboardState> {
        Arc::clone(&self.state.borrow())
    }

    fn publish(&self, state: DashboardState) {
        self.state.send_replace(Arc::new(state));
    }

    fn on_event(&self, event: SyncEvent) {
        let mut inner = self.lock();
        if !inner.mounted {
            return;
        }
        if inner.live {
            let next = reduce(&self.current(), &event);
            self.publish(next);
        } else {
            inner.buffer(event);
        }
    }

    fn complete(&self, generation: u64, result: Result<Snapshot, FetchError>) {
        let mut inner = self.lock();
        if !inner.mounted || inner.generation != generation {
            tracing::warn!(generation, "discarding stale snapshot fetch");
            return;
        }
        let current = self.current();
        let base = match result {
            Ok(snapshot) => DashboardState::from_snapshot(snapshot),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot fetch failed");
                let failed = DashboardState {
                    status: LoadStatus::Failed,
                    error: Some(format!("Failed to load dashboard data: {e}")),
                    ..DashboardState::clone(&current)
                };
                if !failed.has_data() {
                    // Nothing to replay onto yet; keep buffering for a retry.
                    self.publish(failed);
                    return;
                }
                failed
            }
        };

        let replayed = inner.pending.len();
        let state = inner
            .pending
            .drain(..)
            .fold(base, |state, event| reduce(&state, &event));
        inner.live = true;
        if state.status == LoadStatus::Ready {
            tracing::info!(
                active = state.active_proposals.as_ref().map_or(0, |a| a.len()),
                past = state.past_proposals.as_ref().map_or(0, |p| p.len()),
                replayed,
                "synchronizer loaded"
            );
        }
        self.publish(state);
    }
}

fn listen<E>(bus: &DashboardBus, shared: &Arc<Shared>) -> Subscription
where
    E: BusEvent<DashboardEvents> + Clone,
    WireEvent: From<E>,
{
    let shared: Weak<Shared> = Arc::downgrade(shared);
    bus.subscribe(move |event: &E| {
        if let Some(shared) = shared.upgrade() {
            shared.on_event(WireEvent::from(event.clone()));
        }
    })
}

/// One mounted consumer of the dashboard bus.
///
/// Dropping a `Synchronizer` unsubscribes it and aborts any in-flight
/// fetch, exactly like [`unmount`](Synchronizer::unmount).
pub struct Synchronizer {
    shared: Arc<Shared>,
    bus: DashboardBus,
    voting: VotingService,
    source: Arc<dyn DataSource>,
    subscriptions: Vec<Subscription>,
    fetch: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("status", &self.shared.current().status)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl Synchronizer {
    /// Subscribe to the catalogue on `bus` and start loading from `source`.
    ///
    /// The returned synchronizer starts in [`LoadStatus::Loading`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn mount(bus: &DashboardBus, voting: VotingService, source: Arc<dyn DataSource>) -> Self {
        let (state, _) = watch::channel(Arc::new(DashboardState::default()));
        let shared = Arc::new(Shared {
            state,
            inner: Mutex::new(Inner {
                mounted: true,
                live: false,
                generation: 0,
                pending: VecDeque::new(),
            }),
        });

        let subscriptions = vec![
            listen::<PortfolioValueUpdated>(bus, &shared),
            listen::<RiskScoreChanged>(bus, &shared),
            listen::<PerformanceDataUpdated>(bus, &shared),
            listen::<AssetPerformanceChanged>(bus, &shared),
            listen::<VoteSubmitted>(bus, &shared),
            listen::<ProposalUpdated>(bus, &shared),
            listen::<NewProposal>(bus, &shared),
            listen::<ProposalClosed>(bus, &shared),
        ];
        tracing::debug!(subscriptions = subscriptions.len(), "synchronizer mounted");

        let sync = Self {
            shared,
            bus: bus.clone(),
            voting,
            source,
            subscriptions,
            fetch: Mutex::new(None),
        };
        sync.start_fetch();
        sync
    }

    fn start_fetch(&self) {
        let generation = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.live = false;
            inner.generation
        };
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let task = tokio::spawn(async move {
            let result = fetch_snapshot(source.as_ref()).await;
            shared.complete(generation, result);
        });

        let previous = self
            .fetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// The current read model.
    pub fn state(&self) -> Arc<DashboardState> {
        self.shared.current()
    }

    /// A receiver that observes every published state.
    pub fn watch(&self) -> watch::Receiver<Arc<DashboardState>> {
        self.shared.state.subscribe()
    }

    /// Published states as a stream, starting with the current one.
    pub fn updates(&self) -> WatchStream<Arc<DashboardState>> {
        WatchStream::new(self.watch())
    }

    /// Wait until the current fetch settles, then return the state.
    pub async fn loaded(&self) -> Arc<DashboardState> {
        let mut rx = self.watch();
        match rx.wait_for(|s| s.status != LoadStatus::Loading).await {
            Ok(state) => Arc::clone(&state),
            Err(_) => self.state(),
        }
    }

    /// Cast, change, or (with `None`) remove the caller's vote.
    ///
    /// On success, emits `vote-submitted` on the bus, which every mounted
    /// synchronizer (this one included) merges, and returns the updated
    /// active collection.
    ///
    /// # Errors
    ///
    /// Returns the [`VoteError`] from the voting service. Nothing is emitted
    /// on error.
    pub async fn vote(
        &self,
        id: impl Into<ProposalId>,
        choice: Option<VoteChoice>,
    ) -> Result<Vec<Proposal>, VoteError> {
        let proposal_id = id.into();
        let updated = self
            .voting
            .submit_vote(proposal_id.clone(), choice)
            .await?;
        let event = VoteSubmitted {
            proposal_id,
            vote: choice,
            updated_proposals: updated.clone(),
        };
        if let Err(e) = self.bus.emit(&event) {
            tracing::error!(error = %e, "vote-submitted emit refused");
        }
        Ok(updated)
    }

    /// Refetch the snapshot.
    ///
    /// Existing data stays visible while the refetch runs. Events arriving
    /// meanwhile are buffered and replayed on whatever the refetch yields.
    pub fn retry(&self) {
        {
            let _inner = self.shared.lock();
            let state = DashboardState {
                status: LoadStatus::Loading,
                error: None,
                ..DashboardState::clone(&self.shared.current())
            };
            self.shared.publish(state);
        }
        tracing::debug!("retrying snapshot fetch");
        self.start_fetch();
    }

    /// Clear the failure message without dropping data.
    pub fn dismiss_error(&self) {
        let _inner = self.shared.lock();
        let current = self.shared.current();
        if current.error.is_none() {
            return;
        }
        let status = match current.status {
            LoadStatus::Failed if current.has_data() => LoadStatus::Ready,
            status => status,
        };
        self.shared.publish(DashboardState {
            status,
            error: None,
            ..DashboardState::clone(&current)
        });
    }

    pub fn is_mounted(&self) -> bool {
        self.shared.lock().mounted
    }

    /// Unsubscribe from the bus and abort any in-flight fetch.
    pub fn unmount(self) {
        drop(self);
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.lock();
            inner.mounted = false;
            inner.pending.clear();
        }
        if let Some(task) = self
            .fetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.subscriptions.clear();
        tracing::debug!("synchronizer unmounted");
    }
}
