//! Simulated streaming feed.
//!
//! Stands in for a server push channel: on fixed intervals it perturbs a
//! private mirror of the dashboard state and publishes the result on the
//! bus under the same event names a real backend would use. Every market
//! step is also stored in the shared [`MarketMirror`] before it is emitted.
//! Proposal changes go through the [`VotingService`] as deltas, so closes
//! are decided by the same rule as everywhere else and concurrent user
//! votes are never overwritten.
//!
//! [`FeedState`] holds the mirror and exposes every step as a plain method,
//! so the perturbation rules can be tested without timers.
//! [`StreamingGenerator::start`] drives those steps from one tokio task.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{Days, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::bus::BusEvent;
use crate::domain::{
    AssetPerformance, DashboardOverview, DashboardPerformance, PerformancePoint, Proposal,
    ProposalId, RISK_SCALE, RiskScore, VoteChoice, percentage_change, rank_top_performers,
    rank_underperformers,
};
use crate::error::VoteError;
use crate::events::{
    AssetPerformanceChanged, DashboardBus, DashboardEvents, NewProposal, PerformanceDataUpdated,
    PortfolioValueUpdated, ProposalClosed, ProposalUpdated, RiskScoreChanged,
};
use crate::source::MarketMirror;
use crate::voting::VotingService;

/// Cadences and bounds of the simulated feed.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use liquidity_live::GeneratorConfig;
///
/// let config = GeneratorConfig {
///     portfolio_interval: Duration::from_secs(1),
///     seed: Some(42),
///     ..GeneratorConfig::default()
/// };
/// assert_eq!(config.history_window, 10);
/// ```
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Default: 3 seconds.
    pub portfolio_interval: Duration,
    /// Default: 10 seconds.
    pub risk_interval: Duration,
    /// Probability that a risk tick produces a new reading.
    ///
    /// Default: 0.3.
    pub risk_activation: f64,
    /// Default: 15 seconds.
    pub performance_interval: Duration,
    /// Default: 8 seconds.
    pub asset_interval: Duration,
    /// Default: 5 seconds.
    pub proposal_interval: Duration,
    /// Largest relative portfolio move per tick (0.003 = ±0.3%).
    pub portfolio_max_change: f64,
    /// Largest relative move between consecutive history points.
    ///
    /// Default: 0.01.
    pub performance_max_change: f64,
    /// Largest per-tick move of an asset's performance, in percentage points.
    ///
    /// Default: 0.5.
    pub asset_jitter: f64,
    /// Maximum number of history points retained.
    ///
    /// Default: 10.
    pub history_window: usize,
    /// Countdown seconds removed from every proposal per proposal tick.
    ///
    /// Default: 3600, so one tick stands for one hour of voting.
    pub countdown_step_secs: u64,
    /// Probability that a proposal tick records outside voting activity.
    ///
    /// Default: 0.5.
    pub vote_activity: f64,
    /// Probability that a proposal tick opens a synthetic proposal.
    ///
    /// Default: 0.1.
    pub new_proposal_chance: f64,
    /// Fixed RNG seed for reproducible feeds. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            portfolio_interval: Duration::from_secs(3),
            risk_interval: Duration::from_secs(10),
            risk_activation: 0.3,
            performance_interval: Duration::from_secs(15),
            asset_interval: Duration::from_secs(8),
            proposal_interval: Duration::from_secs(5),
            portfolio_max_change: 0.003,
            performance_max_change: 0.01,
            asset_jitter: 0.5,
            history_window: 10,
            countdown_step_secs: 3_600,
            vote_activity: 0.5,
            new_proposal_chance: 0.1,
            seed: None,
        }
    }
}

fn symmetric(rng: &mut SmallRng, bound: f64) -> f64 {
    if bound > 0.0 {
        rng.gen_range(-bound..=bound)
    } else {
        0.0
    }
}

/// Jitter every asset, then re-rank both lists.
///
/// Top performers end up sorted best first and underperformers worst first,
/// whatever order they were in before.
pub fn rerank_assets(
    top_performers: &mut [AssetPerformance],
    underperformers: &mut [AssetPerformance],
    mut jitter: impl FnMut(&AssetPerformance) -> f64,
) {
    for asset in top_performers.iter_mut().chain(underperformers.iter_mut()) {
        asset.performance += jitter(asset);
    }
    rank_top_performers(top_performers);
    rank_underperformers(underperformers);
}

const SYNTHETIC_TOPICS: [(&str, &str, &str); 4] = [
    (
        "Rebalance stablecoin reserves",
        "Shift 10% of USDT reserves into USDC and DAI.",
        "Treasury",
    ),
    (
        "Lower liquidation penalty",
        "Reduce the liquidation penalty on blue-chip collateral from 8% to 6%.",
        "Risk",
    ),
    (
        "List cbETH/ETH pool",
        "Open a concentrated liquidity pool for cbETH/ETH.",
        "Listings",
    ),
    (
        "Cut swap fee on stable pairs",
        "Reduce the stable-pair swap fee to 0.01%.",
        "Fees",
    ),
];

/// The generator's private mirror of dashboard state.
///
/// Every `step_*` method mutates only this mirror and returns the payload
/// to publish.
pub struct FeedState {
    overview: DashboardOverview,
    performance: DashboardPerformance,
    config: GeneratorConfig,
    rng: SmallRng,
}

impl fmt::Debug for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedState")
            .field("portfolio", &self.overview.portfolio.value)
            .field("risk", &self.overview.risk.level())
            .field("history", &self.performance.historical_performance.len())
            .finish()
    }
}

impl FeedState {
    pub fn new(
        overview: DashboardOverview,
        performance: DashboardPerformance,
        config: GeneratorConfig,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            overview,
            performance,
            config,
            rng,
        }
    }

    pub fn overview(&self) -> &DashboardOverview {
        &self.overview
    }

    pub fn performance(&self) -> &DashboardPerformance {
        &self.performance
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Move the portfolio value by a bounded relative amount.
    pub fn step_portfolio(&mut self) -> PortfolioValueUpdated {
        let change = symmetric(&mut self.rng, self.config.portfolio_max_change);
        let portfolio = &mut self.overview.portfolio;
        let previous = portfolio.value;
        portfolio.value = previous * (1.0 + change);
        portfolio.percentage_change = percentage_change(previous, portfolio.value);
        portfolio.last_updated = Utc::now();

        PortfolioValueUpdated {
            portfolio_value: portfolio.value,
            percentage_change: portfolio.percentage_change,
            last_updated: portfolio.last_updated,
        }
    }

    /// Possibly move the risk reading one step along the scale.
    ///
    /// Returns `None` on ticks that do not activate.
    pub fn step_risk(&mut self) -> Option<RiskScoreChanged> {
        if !self.rng.gen_bool(self.config.risk_activation.clamp(0.0, 1.0)) {
            return None;
        }
        let current = self.overview.risk.index() as i64;
        let step: i64 = self.rng.gen_range(-1..=1);
        let next = (current + step).clamp(0, RISK_SCALE.len() as i64 - 1) as usize;
        self.overview.risk = RiskScore::from_scale(next);
        Some(RiskScoreChanged {
            score: self.overview.risk,
        })
    }

    /// Append the next daily history point, evicting the oldest past the
    /// window.
    pub fn step_performance(&mut self) -> PerformanceDataUpdated {
        let change = symmetric(&mut self.rng, self.config.performance_max_change);
        let history = &mut self.performance.historical_performance;
        let next = match history.last() {
            Some(last) => PerformancePoint {
                date: last
                    .date
                    .checked_add_days(Days::new(1))
                    .unwrap_or(last.date),
                value: last.value * (1.0 + change),
            },
            None => PerformancePoint {
                date: Utc::now().date_naive(),
                value: self.overview.portfolio.value,
            },
        };
        history.push(next);

        let window = self.config.history_window.max(1);
        if history.len() > window {
            let excess = history.len() - window;
            history.drain(..excess);
        }

        PerformanceDataUpdated {
            historical_performance: history.clone(),
        }
    }

    /// Jitter every tracked asset and re-rank both lists.
    pub fn step_assets(&mut self) -> AssetPerformanceChanged {
        let bound = self.config.asset_jitter;
        let rng = &mut self.rng;
        rerank_assets(
            &mut self.overview.top_performers,
            &mut self.overview.underperformers,
            |_| symmetric(rng, bound),
        );
        AssetPerformanceChanged {
            top_performers: self.overview.top_performers.clone(),
            underperformers: self.overview.underperformers.clone(),
        }
    }

    /// Pick outside weight for one of `active`, sized against its
    /// headroom in that snapshot.
    ///
    /// The voting service re-checks the headroom when the delta is applied.
    pub fn outside_votes(&mut self, active: &[Proposal]) -> Option<OutsideVotes> {
        let activity = self.config.vote_activity.clamp(0.0, 1.0);
        if active.is_empty() || !self.rng.gen_bool(activity) {
            return None;
        }
        let proposal = &active[self.rng.gen_range(0..active.len())];
        let headroom = proposal
            .total_votes
            .saturating_sub(proposal.tally().participation());
        if headroom == 0 {
            return None;
        }
        let cap = (proposal.total_votes / 100).clamp(1, headroom);
        let choice = if self.rng.gen_bool(0.6) {
            VoteChoice::For
        } else {
            VoteChoice::Against
        };
        Some(OutsideVotes {
            id: proposal.id.clone(),
            choice,
            weight: self.rng.gen_range(1..=cap),
        })
    }

    /// Possibly draft a new synthetic proposal.
    pub fn draft_proposal(&mut self) -> Option<Proposal> {
        if !self.rng.gen_bool(self.config.new_proposal_chance.clamp(0.0, 1.0)) {
            return None;
        }
        let (title, description, category) =
            SYNTHETIC_TOPICS[self.rng.gen_range(0..SYNTHETIC_TOPICS.len())];
        let total: u64 = self.rng.gen_range(1_000_000..=3_000_000);
        let quorum = total * self.rng.gen_range(20..=30) / 100;
        let hours: u64 = self.rng.gen_range(24..=72);
        Some(
            Proposal::new(ProposalId::generate(), title, description, category)
                .with_tally(0, 0, quorum, total)
                .with_time_remaining(hours * 3_600),
        )
    }
}

/// Weight cast on a proposal by participants other than the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutsideVotes {
    pub id: ProposalId,
    pub choice: VoteChoice,
    pub weight: u64,
}

/// Timer-driven feed publishing onto a [`DashboardBus`].
#[derive(Debug)]
pub struct StreamingGenerator {
    feed: FeedState,
    bus: DashboardBus,
    voting: VotingService,
    market: MarketMirror,
}

impl StreamingGenerator {
    /// Build a generator whose mirror starts from `market`'s current
    /// snapshot.
    pub fn new(
        bus: DashboardBus,
        voting: VotingService,
        market: MarketMirror,
        config: GeneratorConfig,
    ) -> Self {
        let start = market.current();
        Self {
            feed: FeedState::new(start.overview.clone(), start.performance.clone(), config),
            bus,
            voting,
            market,
        }
    }

    /// Spawn the feed task on the current tokio runtime.
    ///
    /// The feed runs until [`GeneratorHandle::stop`] is called or the
    /// handle is dropped.
    pub fn start(self) -> GeneratorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let emitted = Arc::new(AtomicU64::new(0));

        let publisher = Publisher {
            bus: self.bus,
            market: self.market,
            shutdown: shutdown_rx.clone(),
            emitted: Arc::clone(&emitted),
        };
        let task = tokio::spawn(run_generator(
            self.feed,
            publisher,
            self.voting,
            shutdown_rx,
            Arc::clone(&running),
        ));

        GeneratorHandle {
            shutdown_tx,
            running,
            emitted,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }
}

/// Emits on the bus unless shutdown has been requested.
struct Publisher {
    bus: DashboardBus,
    market: MarketMirror,
    shutdown: watch::Receiver<bool>,
    emitted: Arc<AtomicU64>,
}

impl Publisher {
    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn publish<E: BusEvent<DashboardEvents>>(&self, payload: &E) {
        if self.stopping() {
            return;
        }
        match self.bus.emit(payload) {
            Ok(dispatch) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    event = E::NAME,
                    delivered = dispatch.delivered,
                    failed = dispatch.failed,
                    "feed emitted"
                );
            }
            Err(e) => tracing::error!(event = E::NAME, error = %e, "feed emit refused"),
        }
    }

    /// Store the feed's market state, then emit `payload`.
    fn publish_market<E: BusEvent<DashboardEvents>>(&self, feed: &FeedState, payload: &E) {
        if self.stopping() {
            return;
        }
        self.market.store(feed.overview(), feed.performance());
        self.publish(payload);
    }
}

async fn run_generator(
    mut feed: FeedState,
    publisher: Publisher,
    voting: VotingService,
    mut shutdown_rx: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
) {
    let config = feed.config().clone();
    let timer = |period: Duration| {
        let period = period.max(Duration::from_millis(1));
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    };
    let mut portfolio = timer(config.portfolio_interval);
    let mut risk = timer(config.risk_interval);
    let mut performance = timer(config.performance_interval);
    let mut assets = timer(config.asset_interval);
    let mut proposals = timer(config.proposal_interval);

    tracing::info!(?config, "streaming generator started");

    loop {
        tokio::select! {
            biased;
            // Resolves on `stop` and also when the handle is dropped.
            _ = shutdown_rx.changed() => break,
            _ = portfolio.tick() => {
                let event = feed.step_portfolio();
                publisher.publish_market(&feed, &event);
            }
            _ = risk.tick() => {
                if let Some(event) = feed.step_risk() {
                    publisher.publish_market(&feed, &event);
                }
            }
            _ = performance.tick() => {
                let event = feed.step_performance();
                publisher.publish_market(&feed, &event);
            }
            _ = assets.tick() => {
                let event = feed.step_assets();
                publisher.publish_market(&feed, &event);
            }
            _ = proposals.tick() => {
                match proposal_tick(&mut feed, &publisher, &voting).await {
                    Ok(()) => {}
                    Err(VoteError::ServiceGone) => {
                        tracing::warn!("voting service gone, stopping proposal feed");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "proposal tick failed"),
                }
            }
        }
    }

    running.store(false, Ordering::Release);
    tracing::info!(
        emitted = publisher.emitted.load(Ordering::Relaxed),
        "streaming generator stopped"
    );
}

/// Count proposals down, record outside votes, close ended proposals, and
/// occasionally open a new one.
async fn proposal_tick(
    feed: &mut FeedState,
    publisher: &Publisher,
    voting: &VotingService,
) -> Result<(), VoteError> {
    let step = feed.config().countdown_step_secs;
    for proposal in voting.tick(step).await? {
        publisher.publish(&ProposalUpdated { proposal });
    }

    let active = voting.active_proposals().await?;
    let live: Vec<Proposal> = active.iter().filter(|p| !p.has_ended()).cloned().collect();
    if let Some(votes) = feed.outside_votes(&live)
        && let Some(proposal) = voting
            .record_outside_votes(votes.id, votes.choice, votes.weight)
            .await?
    {
        publisher.publish(&ProposalUpdated { proposal });
    }

    for ended in active.iter().filter(|p| p.has_ended()) {
        if publisher.stopping() {
            return Ok(());
        }
        let past_proposal = voting.close_proposal(ended.id.clone()).await?;
        publisher.publish(&ProposalClosed {
            proposal_id: past_proposal.id.clone(),
            past_proposal,
        });
    }

    if let Some(proposal) = feed.draft_proposal() {
        voting.open_proposal(proposal.clone()).await?;
        publisher.publish(&NewProposal { proposal });
    }
    Ok(())
}

/// Controls a running [`StreamingGenerator`].
///
/// Dropping the handle stops the feed at its next scheduling point; call
/// [`stop`](GeneratorHandle::stop) to wait until it has fully stopped.
#[derive(Debug)]
pub struct GeneratorHandle {
    shutdown_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    emitted: Arc<AtomicU64>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GeneratorHandle {
    /// Stop the feed and wait for its task to exit.
    ///
    /// No event is emitted once this returns. Calling it again is a no-op.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "generator task failed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Total events published so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PastProposal, ProposalResult};
    use crate::source::SeedData;
    use crate::voting::{ProposalBook, VotingConfig, spawn_voting_service};
    use std::sync::Mutex;

    fn config() -> GeneratorConfig {
        GeneratorConfig {
            seed: Some(7),
            ..GeneratorConfig::default()
        }
    }

    fn feed(config: GeneratorConfig) -> FeedState {
        let seed = SeedData::demo();
        FeedState::new(seed.overview, seed.performance, config)
    }

    #[test]
    fn config_defaults() {
        let config = GeneratorConfig::default();
        assert_eq!(config.portfolio_interval, Duration::from_secs(3));
        assert_eq!(config.history_window, 10);
        assert!((config.portfolio_max_change - 0.003).abs() < f64::EPSILON);
    }

    #[test]
    fn portfolio_moves_within_bound() {
        let mut feed = feed(config());
        for _ in 0..500 {
            let before = feed.overview().portfolio.value;
            let event = feed.step_portfolio();
            assert!(event.percentage_change.abs() <= 0.3 + 1e-9);
            let expected = percentage_change(before, event.portfolio_value);
            assert!((event.percentage_change - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn portfolio_at_zero_reports_zero_change() {
        let mut feed = feed(config());
        feed.overview.portfolio.value = 0.0;
        let event = feed.step_portfolio();
        assert_eq!(event.portfolio_value, 0.0);
        assert_eq!(event.percentage_change, 0.0);
    }

    #[test]
    fn risk_activation_bounds() {
        let mut never = feed(GeneratorConfig {
            risk_activation: 0.0,
            ..config()
        });
        assert!((0..100).all(|_| never.step_risk().is_none()));

        let mut always = feed(GeneratorConfig {
            risk_activation: 1.0,
            ..config()
        });
        for _ in 0..100 {
            let before = always.overview().risk.index() as i64;
            let event = always.step_risk().unwrap();
            let score = event.score;
            assert!((score.index() as i64 - before).abs() <= 1);
            let row = RISK_SCALE[score.index()];
            assert_eq!((score.level(), score.status()), (row.level, row.status));
            assert_eq!(always.overview().risk, score);
        }
    }

    #[test]
    fn history_is_a_fifo_window() {
        let mut feed = feed(config());
        let first_before = feed.performance().historical_performance[0].clone();
        let last_before = feed.performance().historical_performance[9].clone();

        let event = feed.step_performance();
        let history = &event.historical_performance;
        assert_eq!(history.len(), 10);
        assert_ne!(history[0], first_before);
        assert_eq!(history[8], last_before);
        assert_eq!(
            history[9].date,
            last_before.date.checked_add_days(Days::new(1)).unwrap()
        );
        let change = (history[9].value - last_before.value) / last_before.value;
        assert!(change.abs() <= 0.01 + 1e-9);

        for _ in 0..25 {
            let event = feed.step_performance();
            assert_eq!(event.historical_performance.len(), 10);
        }
    }

    #[test]
    fn history_starts_from_portfolio_when_empty() {
        let mut feed = feed(GeneratorConfig {
            history_window: 3,
            ..config()
        });
        feed.performance.historical_performance.clear();
        let event = feed.step_performance();
        assert_eq!(event.historical_performance.len(), 1);
        assert_eq!(
            event.historical_performance[0].value,
            feed.overview().portfolio.value
        );
    }

    #[test]
    fn jittered_assets_are_reranked() {
        let mut top = vec![
            AssetPerformance::new("A", "Alpha", 5.0),
            AssetPerformance::new("B", "Beta", 3.0),
        ];
        let mut under: Vec<AssetPerformance> = vec![];
        rerank_assets(&mut top, &mut under, |asset| {
            if asset.symbol == "B" { 3.0 } else { 0.0 }
        });
        let order: Vec<_> = top.iter().map(|a| a.symbol.as_str()).collect();
        assert_eq!(order, ["B", "A"]);
        assert_eq!(top[0].performance, 6.0);
    }

    #[test]
    fn step_assets_keeps_both_lists_sorted() {
        let mut feed = feed(GeneratorConfig {
            asset_jitter: 10.0,
            ..config()
        });
        for _ in 0..50 {
            let event = feed.step_assets();
            assert!(event
                .top_performers
                .windows(2)
                .all(|w| w[0].performance >= w[1].performance));
            assert!(event
                .underperformers
                .windows(2)
                .all(|w| w[0].performance <= w[1].performance));
            assert_eq!(event.top_performers.len(), 3);
            assert_eq!(event.underperformers.len(), 2);
        }
    }

    #[test]
    fn outside_votes_respect_headroom() {
        let mut feed = feed(GeneratorConfig {
            vote_activity: 1.0,
            ..config()
        });
        let full = Proposal::new("full", "t", "d", "c").with_tally(60, 40, 50, 100);
        assert!(feed.outside_votes(&[full]).is_none());

        // Tallies over the total must not underflow the headroom.
        let mut over = Proposal::new("over", "t", "d", "c").with_tally(60, 40, 50, 100);
        over.votes_for = 90;
        assert!(feed.outside_votes(&[over]).is_none());

        let open = Proposal::new("open", "t", "d", "c").with_tally(0, 0, 50, 100);
        for _ in 0..50 {
            let votes = feed.outside_votes(std::slice::from_ref(&open)).unwrap();
            assert_eq!(votes.id, open.id);
            assert_eq!(votes.weight, 1);
            let mut applied = open.clone();
            assert_eq!(applied.record_outside_votes(votes.choice, votes.weight), 1);
            applied.validate().unwrap();
        }
    }

    #[test]
    fn drafted_proposals_are_valid() {
        let mut feed = feed(GeneratorConfig {
            new_proposal_chance: 1.0,
            ..config()
        });
        for _ in 0..20 {
            let proposal = feed.draft_proposal().unwrap();
            proposal.validate().unwrap();
            assert!(proposal.time_remaining_secs >= 24 * 3_600);
        }
    }

    fn build_generator(
        bus: &DashboardBus,
        active: Vec<Proposal>,
        config: GeneratorConfig,
    ) -> (StreamingGenerator, VotingService) {
        let seed = SeedData::demo();
        let voting = spawn_voting_service(
            ProposalBook::new(active, vec![]).unwrap(),
            VotingConfig::default(),
        );
        let generator = StreamingGenerator::new(
            bus.clone(),
            voting.clone(),
            MarketMirror::from(&seed),
            config,
        );
        (generator, voting)
    }

    #[tokio::test(start_paused = true)]
    async fn feed_publishes_on_its_cadence() {
        let bus = DashboardBus::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let t = Arc::clone(&ticks);
        let _sub = bus.subscribe(move |_: &PortfolioValueUpdated| {
            t.fetch_add(1, Ordering::SeqCst);
        });

        let (generator, _voting) = build_generator(&bus, vec![], config());
        let handle = generator.start();
        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_emissions_after_stop() {
        let bus = DashboardBus::new();
        let (generator, _voting) = build_generator(
            &bus,
            vec![],
            GeneratorConfig {
                portfolio_interval: Duration::from_millis(100),
                asset_interval: Duration::from_millis(150),
                risk_activation: 1.0,
                risk_interval: Duration::from_millis(200),
                ..config()
            },
        );
        let handle = generator.start();
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.stop().await;
        assert!(!handle.is_running());

        let frozen = handle.emitted();
        assert!(frozen > 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.emitted(), frozen);

        // Stopping twice is harmless.
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_feed_resumes_from_shared_market() {
        let bus = DashboardBus::new();
        let seen: Arc<Mutex<Vec<PortfolioValueUpdated>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e: &PortfolioValueUpdated| {
            sink.lock().unwrap().push(e.clone());
        });
        let seed = SeedData::demo();
        let market = MarketMirror::from(&seed);
        let voting = spawn_voting_service(ProposalBook::default(), VotingConfig::default());
        let fast = GeneratorConfig {
            portfolio_interval: Duration::from_millis(100),
            ..config()
        };

        let first = StreamingGenerator::new(
            bus.clone(),
            voting.clone(),
            market.clone(),
            fast.clone(),
        )
        .start();
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        first.stop().await;

        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_ne!(last.portfolio_value, seed.overview.portfolio.value);
        assert_eq!(market.current().overview.portfolio.value, last.portfolio_value);

        let second = StreamingGenerator::new(bus.clone(), voting, market.clone(), fast).start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        second.stop().await;

        let resumed = seen.lock().unwrap().last().cloned().unwrap();
        let expected = percentage_change(last.portfolio_value, resumed.portfolio_value);
        assert!((resumed.percentage_change - expected).abs() < 1e-9);
        assert!(resumed.percentage_change.abs() <= 0.3 + 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_feed() {
        let bus = DashboardBus::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let t = Arc::clone(&ticks);
        let _sub = bus.subscribe(move |_: &PortfolioValueUpdated| {
            t.fetch_add(1, Ordering::SeqCst);
        });
        let (generator, _voting) = build_generator(&bus, vec![], config());
        let handle = generator.start();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        drop(handle);
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn ended_proposal_closes_through_voting_service() {
        let bus = DashboardBus::new();
        let closed: Arc<Mutex<Vec<PastProposal>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&closed);
        let _sub = bus.subscribe(move |e: &ProposalClosed| {
            sink.lock().unwrap().push(e.past_proposal.clone());
        });
        let updates = Arc::new(AtomicU64::new(0));
        let u = Arc::clone(&updates);
        let _upd = bus.subscribe(move |_: &ProposalUpdated| {
            u.fetch_add(1, Ordering::SeqCst);
        });

        let ending = Proposal::new("ending", "Ending soon", "d", "Risk")
            .with_tally(80, 20, 120, 1_000)
            .with_time_remaining(1_800);
        let lasting = Proposal::new("lasting", "Long vote", "d", "Fees")
            .with_tally(0, 0, 10, 1_000)
            .with_time_remaining(30 * 86_400);
        let (generator, voting) = build_generator(
            &bus,
            vec![ending, lasting],
            GeneratorConfig {
                vote_activity: 0.0,
                new_proposal_chance: 0.0,
                ..config()
            },
        );
        let handle = generator.start();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        handle.stop().await;

        let closed = closed.lock().unwrap().clone();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, ProposalId::from("ending"));
        // Majority for, but 100 < quorum of 120.
        assert_eq!(closed[0].result, ProposalResult::Failed);
        assert_eq!(updates.load(Ordering::SeqCst), 2);

        let active = voting.active_proposals().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(voting.past_proposals().await.unwrap(), closed);
    }

    #[tokio::test(start_paused = true)]
    async fn new_proposals_are_opened_before_announcement() {
        let bus = DashboardBus::new();
        let (generator, voting) = build_generator(
            &bus,
            vec![],
            GeneratorConfig {
                new_proposal_chance: 1.0,
                ..config()
            },
        );
        let opened: Arc<Mutex<Vec<ProposalId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&opened);
        let _sub = bus.subscribe(move |e: &NewProposal| {
            sink.lock().unwrap().push(e.proposal.id.clone());
        });

        let handle = generator.start();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        handle.stop().await;

        let opened = opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 1);
        let active = voting.active_proposals().await.unwrap();
        assert_eq!(active[0].id, opened[0]);
    }
}
